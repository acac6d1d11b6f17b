// Error types shared by the transport, descriptors and the query executor

use serde_json::Value;
use thiserror::Error;

// Errors surfaced to query consumers. Clone because one fetch outcome is
// delivered to every consumer coalesced onto it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("HTTP error: {status} - {message}")]
    HttpError {
        status: u16,
        message: String,
        body: Option<Value>,
    },

    #[error("Schema error: {0}")]
    SchemaError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl QueryError {
    /// Builds an `HttpError` from a non-2xx response, keeping the JSON error
    /// body when the server sent one.
    pub fn http(status: u16, body: &[u8]) -> Self {
        let parsed = serde_json::from_slice::<Value>(body).ok();
        let message = parsed
            .as_ref()
            .and_then(|value| value.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| {
                let text = String::from_utf8_lossy(body).trim().to_string();
                (!text.is_empty() && parsed.is_none()).then_some(text)
            })
            .unwrap_or_else(|| {
                reqwest::StatusCode::from_u16(status)
                    .ok()
                    .and_then(|code| code.canonical_reason())
                    .unwrap_or("Unknown status")
                    .to_string()
            });

        QueryError::HttpError {
            status,
            message,
            body: parsed,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            QueryError::HttpError { status, .. } => Some(*status),
            _ => None,
        }
    }

    // Whether another attempt may succeed. Server-reported failures only
    // qualify on endpoints marked idempotent-retryable.
    pub fn is_retryable(&self, idempotent: bool) -> bool {
        match self {
            QueryError::NetworkError(_) | QueryError::Timeout(_) => true,
            QueryError::HttpError { status, .. } => {
                idempotent && (*status >= 500 || *status == 408 || *status == 429)
            }
            QueryError::SchemaError(_) | QueryError::ValidationError(_) => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Initialization error: {0}")]
    InitError(String),
}
