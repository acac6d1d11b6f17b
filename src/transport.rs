// HTTP transport used by the query executor.
// A transport issues exactly one request per call; retries belong to the executor.

use crate::config::ClientConfig;
use crate::error::{ClientError, QueryError};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Method, Url};
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    // Deadline for this attempt; the caller's, never a client-wide one
    pub timeout: Option<Duration>,
}

impl TransportRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone)]
pub struct RawPayload {
    pub status: u16,
    pub body: Bytes,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, request: TransportRequest) -> Result<RawPayload, QueryError>;
}

// No client-wide timeout; each request carries its own deadline
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        config.parsed_base_url()?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ClientError::InitError(format!("failed to build http client: {}", e)))?;

        Ok(Self { client })
    }

    fn map_error(request: &TransportRequest, error: reqwest::Error) -> QueryError {
        match request.timeout {
            Some(timeout) if error.is_timeout() => QueryError::Timeout(timeout.as_millis() as u64),
            _ => QueryError::NetworkError(error.to_string()),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: TransportRequest) -> Result<RawPayload, QueryError> {
        let mut builder = self.client.request(request.method.clone(), request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Self::map_error(&request, e))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| Self::map_error(&request, e))?;

        tracing::debug!(
            method = %request.method,
            url = %request.url,
            status = status.as_u16(),
            bytes = body.len(),
            "transport response"
        );

        if !status.is_success() {
            return Err(QueryError::http(status.as_u16(), &body));
        }

        Ok(RawPayload {
            status: status.as_u16(),
            body,
        })
    }
}
