use std::time::Duration;

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Status codes retried when a policy asks for attempts but names none.
pub fn default_retry_status_codes() -> Vec<u16> {
    vec![429, 500, 502, 503, 504]
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first call; zero disables retrying.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, alias = "onStatusCodes")]
    pub on_status_codes: Vec<u16>,
    #[serde(default, alias = "useRetryAfterHeader")]
    pub use_retry_after_header: bool,
}

impl RetryPolicy {
    pub fn new(attempts: u32, on_status_codes: Vec<u16>) -> Self {
        Self {
            attempts,
            on_status_codes,
            use_retry_after_header: false,
        }
    }

    pub fn normalized(mut self, max_attempts: u32) -> Self {
        self.attempts = self.attempts.min(max_attempts);
        if self.attempts > 0 && self.on_status_codes.is_empty() {
            self.on_status_codes = default_retry_status_codes();
        }
        self
    }

    /// Whether a response with `status` gets another try after `retries_done`.
    pub fn should_retry(&self, status: u16, retries_done: u32) -> bool {
        retries_done < self.attempts && self.on_status_codes.contains(&status)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Applied to requests that carry no retry settings of their own.
    #[serde(default)]
    pub default_policy: RetryPolicy,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_retry_after_seconds")]
    pub max_retry_after_seconds: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_max_retry_after_seconds() -> u64 {
    60
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default_policy: RetryPolicy::default(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_retry_after_seconds: default_max_retry_after_seconds(),
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.base_delay_ms > self.max_delay_ms {
            return Err(Error::Config(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        Ok(())
    }

    /// Exponential backoff for the `retry_index`-th retry (0-based), capped.
    pub fn backoff_delay(&self, retry_index: u32) -> Duration {
        let factor = 1u64.checked_shl(retry_index.min(32)).unwrap_or(u64::MAX);
        Duration::from_millis(
            self.base_delay_ms
                .saturating_mul(factor)
                .min(self.max_delay_ms),
        )
    }

    /// `retry-after-ms` (milliseconds) or `retry-after` (seconds), clamped to
    /// `max_retry_after_seconds`.
    pub fn retry_after_delay(&self, headers: &HeaderMap) -> Option<Duration> {
        let cap = self.max_retry_after_seconds as f64;
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .and_then(|value| value.parse::<f64>().ok())
                .filter(|value| value.is_finite() && *value >= 0.0)
        };
        let secs = match header("retry-after-ms") {
            Some(ms) => ms / 1000.0,
            None => header("retry-after")?,
        };
        // Clamp before converting: `from_secs_f64` panics past `Duration::MAX`.
        Some(Duration::from_secs_f64(secs.min(cap)))
    }

    pub fn delay_for(&self, policy: &RetryPolicy, headers: &HeaderMap, retry_index: u32) -> Duration {
        if policy.use_retry_after_header {
            if let Some(delay) = self.retry_after_delay(headers) {
                return delay;
            }
        }
        self.backoff_delay(retry_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn attempts_without_codes_use_defaults() {
        let policy = RetryPolicy::new(2, Vec::new()).normalized(5);
        assert_eq!(policy.on_status_codes, default_retry_status_codes());

        let policy = RetryPolicy::default().normalized(5);
        assert!(policy.on_status_codes.is_empty());
        assert!(!policy.should_retry(500, 0));

        let policy = RetryPolicy::new(9, vec![500]).normalized(3);
        assert_eq!(policy.attempts, 3);
    }

    #[test]
    fn should_retry_respects_attempts_and_codes() {
        let policy = RetryPolicy::new(2, vec![500]);
        assert!(policy.should_retry(500, 0));
        assert!(policy.should_retry(500, 1));
        assert!(!policy.should_retry(500, 2));
        assert!(!policy.should_retry(429, 0));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = RetryConfig {
            base_delay_ms: 100,
            max_delay_ms: 350,
            ..RetryConfig::default()
        };
        assert_eq!(config.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(config.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(350));
        assert_eq!(config.backoff_delay(40), Duration::from_millis(350));
    }

    #[test]
    fn retry_after_headers_are_parsed_and_capped() {
        let config = RetryConfig {
            max_retry_after_seconds: 10,
            ..RetryConfig::default()
        };
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("3"));
        assert_eq!(config.retry_after_delay(&headers), Some(Duration::from_secs(3)));

        headers.insert("retry-after-ms", HeaderValue::from_static("250"));
        assert_eq!(
            config.retry_after_delay(&headers),
            Some(Duration::from_millis(250))
        );

        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("120"));
        assert_eq!(config.retry_after_delay(&headers), Some(Duration::from_secs(10)));

        let policy = RetryPolicy {
            use_retry_after_header: false,
            ..RetryPolicy::new(1, vec![429])
        };
        assert_eq!(
            config.delay_for(&policy, &headers, 0),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn huge_retry_after_values_are_capped_not_fatal() {
        let config = RetryConfig {
            max_retry_after_seconds: 10,
            ..RetryConfig::default()
        };
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("1e30"));
        assert_eq!(config.retry_after_delay(&headers), Some(Duration::from_secs(10)));

        let mut headers = HeaderMap::new();
        headers.insert("retry-after-ms", HeaderValue::from_static("1e30"));
        assert_eq!(config.retry_after_delay(&headers), Some(Duration::from_secs(10)));

        let mut headers = HeaderMap::new();
        headers.insert("retry-after-ms", HeaderValue::from_static("1e40"));
        assert_eq!(config.retry_after_delay(&headers), Some(Duration::from_secs(10)));
    }
}
