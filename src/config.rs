// Process-wide client configuration, read once at startup

use crate::error::ClientError;
use reqwest::Url;
use std::time::Duration;

// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    // Deadline for a single transport attempt
    pub timeout_ms: u64,
    // Freshness window for descriptors that don't set their own
    pub default_freshness: Duration,
    pub retry_config: RetryConfig,
    // Capacity of the cache event channel observers listen on
    pub event_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api/v1".to_string(),
            api_key: None,
            timeout_ms: 10_000,
            default_freshness: Duration::ZERO,
            retry_config: RetryConfig::default(),
            event_buffer: 256,
        }
    }
}

// Retry configuration. The default schedule is a fixed delay: with a
// multiplier of 1.0 and no jitter every retry waits `initial_backoff_ms`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 250,
            max_backoff_ms: 5_000,
            backoff_multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry_attempt` (0-based).
    pub fn backoff(&self, retry_attempt: u32) -> Duration {
        let base_backoff_ms = (self.initial_backoff_ms as f64
            * self.backoff_multiplier.powf(retry_attempt as f64))
        .min(self.max_backoff_ms as f64);

        if self.jitter_factor <= 0.0 {
            return Duration::from_millis(base_backoff_ms as u64);
        }

        let jitter = rand::random::<f64>() * self.jitter_factor * base_backoff_ms;
        let backoff_ms = base_backoff_ms * (1.0 - self.jitter_factor / 2.0) + jitter;

        Duration::from_millis(backoff_ms as u64)
    }
}

impl ClientConfig {
    pub const BASE_URL_VAR: &'static str = "BOOKING_API_BASE_URL";
    pub const API_KEY_VAR: &'static str = "BOOKING_API_KEY";
    pub const TIMEOUT_VAR: &'static str = "BOOKING_API_TIMEOUT_MS";
    pub const FRESHNESS_VAR: &'static str = "BOOKING_API_FRESHNESS_SECS";
    pub const RETRY_BUDGET_VAR: &'static str = "BOOKING_API_RETRY_BUDGET";
    pub const BACKOFF_VAR: &'static str = "BOOKING_API_BACKOFF_MS";

    pub fn from_env() -> Result<Self, ClientError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a configuration from any key/value source, falling back to the
    /// defaults for variables that are unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ClientError> {
        let mut config = Self::default();

        if let Some(base_url) = lookup(Self::BASE_URL_VAR) {
            config.base_url = base_url;
        }
        config.api_key = lookup(Self::API_KEY_VAR).filter(|key| !key.trim().is_empty());

        if let Some(timeout_ms) = parse_var::<u64>(&lookup, Self::TIMEOUT_VAR)? {
            config.timeout_ms = timeout_ms;
        }
        if let Some(freshness) = parse_var::<u64>(&lookup, Self::FRESHNESS_VAR)? {
            config.default_freshness = Duration::from_secs(freshness);
        }
        if let Some(retries) = parse_var::<u32>(&lookup, Self::RETRY_BUDGET_VAR)? {
            config.retry_config.max_retries = retries;
        }
        if let Some(backoff_ms) = parse_var::<u64>(&lookup, Self::BACKOFF_VAR)? {
            config.retry_config.initial_backoff_ms = backoff_ms;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        self.parsed_base_url()?;
        if self.timeout_ms == 0 {
            return Err(ClientError::ConfigError(
                "timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.retry_config.backoff_multiplier < 1.0 {
            return Err(ClientError::ConfigError(format!(
                "backoff_multiplier must be at least 1.0, got {}",
                self.retry_config.backoff_multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.retry_config.jitter_factor) {
            return Err(ClientError::ConfigError(format!(
                "jitter_factor must be within [0, 1], got {}",
                self.retry_config.jitter_factor
            )));
        }
        Ok(())
    }

    pub fn parsed_base_url(&self) -> Result<Url, ClientError> {
        let url = Url::parse(&self.base_url).map_err(|e| {
            ClientError::ConfigError(format!("invalid base url {:?}: {}", self.base_url, e))
        })?;
        if !matches!(url.scheme(), "http" | "https") || url.cannot_be_a_base() {
            return Err(ClientError::ConfigError(format!(
                "base url must be an http(s) url, got {:?}",
                self.base_url
            )));
        }
        Ok(url)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    // Headers attached to every request
    pub fn default_headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![("accept".to_string(), "application/json".to_string())];
        if let Some(api_key) = &self.api_key {
            headers.push(("authorization".to_string(), format!("Bearer {}", api_key)));
        }
        headers
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, ClientError>
where
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
            ClientError::ConfigError(format!("{} has invalid value {:?}: {}", name, raw, e))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_fixed_backoff_schedule() {
        let retry = RetryConfig::default();
        for attempt in 0..5 {
            assert_eq!(retry.backoff(attempt), Duration::from_millis(250));
        }
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let retry = RetryConfig {
            max_retries: 6,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        };

        let delays: Vec<u64> = (0..6)
            .map(|attempt| retry.backoff(attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn test_jitter_stays_within_band() {
        let retry = RetryConfig {
            jitter_factor: 0.2,
            initial_backoff_ms: 1_000,
            ..RetryConfig::default()
        };

        for _ in 0..100 {
            let delay = retry.backoff(0).as_millis() as u64;
            assert!((900..=1_100).contains(&delay), "delay out of band: {}", delay);
        }
    }

    #[test]
    fn test_from_lookup_reads_variables() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("BOOKING_API_BASE_URL", "https://api.example.com/v2"),
            ("BOOKING_API_KEY", "secret"),
            ("BOOKING_API_TIMEOUT_MS", "1500"),
            ("BOOKING_API_FRESHNESS_SECS", "60"),
            ("BOOKING_API_RETRY_BUDGET", "4"),
        ]);

        let config =
            ClientConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string())).unwrap();

        assert_eq!(config.base_url, "https://api.example.com/v2");
        assert_eq!(config.timeout(), Duration::from_millis(1500));
        assert_eq!(config.default_freshness, Duration::from_secs(60));
        assert_eq!(config.retry_config.max_retries, 4);
        assert_eq!(config.retry_config.initial_backoff_ms, 250);
        assert!(config
            .default_headers()
            .contains(&("authorization".to_string(), "Bearer secret".to_string())));
    }

    #[test]
    fn test_from_lookup_rejects_bad_values() {
        let result = ClientConfig::from_lookup(|name| {
            (name == ClientConfig::TIMEOUT_VAR).then(|| "soon".to_string())
        });
        assert!(matches!(result, Err(ClientError::ConfigError(_))));

        let result = ClientConfig::from_lookup(|name| {
            (name == ClientConfig::BASE_URL_VAR).then(|| "ftp://files.example.com".to_string())
        });
        assert!(matches!(result, Err(ClientError::ConfigError(_))));
    }

    #[test]
    fn test_jitter_factor_out_of_range_is_rejected() {
        for jitter_factor in [-0.1, 1.5, 3.0, f64::NAN] {
            let config = ClientConfig {
                retry_config: RetryConfig {
                    jitter_factor,
                    ..RetryConfig::default()
                },
                ..ClientConfig::default()
            };
            assert!(
                matches!(config.validate(), Err(ClientError::ConfigError(_))),
                "accepted jitter_factor {}",
                jitter_factor
            );
        }

        let config = ClientConfig {
            retry_config: RetryConfig {
                jitter_factor: 1.0,
                ..RetryConfig::default()
            },
            ..ClientConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = ClientConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.retry_config.max_retries, 2);
        assert_eq!(config.default_headers().len(), 1);
    }
}
