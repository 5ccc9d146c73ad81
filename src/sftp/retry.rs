//! Connection Retry Logic
//!
//! Session establishment is retried with exponential backoff, but only for
//! transient network failures. Credential and key problems fail on the first
//! attempt.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::error::{fmt_error, SftpError};
use crate::ssh::SshError;

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first one
    pub max_retries: u32,

    /// Initial backoff duration in milliseconds
    pub initial_backoff_ms: u64,

    /// Backoff multiplier for each retry
    pub backoff_multiplier: f64,

    /// Maximum backoff duration in milliseconds
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            initial_backoff_ms: 1000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Set custom backoff parameters
    pub fn with_backoff(mut self, initial_ms: u64, multiplier: f64, max_ms: u64) -> Self {
        self.initial_backoff_ms = initial_ms;
        self.backoff_multiplier = multiplier;
        self.max_backoff_ms = max_ms;
        self
    }
}

/// Calculate backoff delay for a given retry attempt (exponential backoff)
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let delay_ms = (config.initial_backoff_ms as f64
        * config.backoff_multiplier.powi(attempt as i32))
    .min(config.max_backoff_ms as f64);

    Duration::from_millis(delay_ms as u64)
}

/// Run `attempt_fn` until it succeeds, fails with a non-transient error, or
/// the retry budget is spent.
///
/// The final error is formatted under `name` with the number of attempts made.
pub async fn retry_connect<T, F, Fut>(
    attempt_fn: F,
    config: &RetryConfig,
    name: &str,
) -> Result<T, SftpError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, SshError>>,
{
    let mut attempts: u32 = 0;
    loop {
        attempts += 1;
        info!("{}: attempt {}/{}", name, attempts, config.max_retries + 1);

        match attempt_fn().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempts <= config.max_retries => {
                let delay = calculate_backoff(attempts - 1, config);
                warn!("{}: attempt {} failed, retrying in {:?}: {}", name, attempts, delay, e);
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if e.is_transient() {
                    warn!("{}: retry budget exhausted after {} attempts: {}", name, attempts, e);
                } else {
                    warn!("{}: non-retryable failure: {}", name, e);
                }
                return Err(fmt_error(e, name, None, Some(attempts)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sftp::error::ErrorCode;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_retries: u32) -> RetryConfig {
        RetryConfig::new(max_retries).with_backoff(1, 2.0, 5)
    }

    #[test]
    fn test_calculate_backoff() {
        let config = RetryConfig::default();

        assert_eq!(calculate_backoff(0, &config).as_millis(), 1000);
        assert_eq!(calculate_backoff(1, &config).as_millis(), 2000);
        assert_eq!(calculate_backoff(2, &config).as_millis(), 4000);
        // Capped at max_backoff_ms
        assert_eq!(calculate_backoff(6, &config).as_millis(), 30_000);
    }

    #[test]
    fn test_calculate_backoff_custom_config() {
        let config = RetryConfig::new(5).with_backoff(200, 3.0, 60_000);

        assert_eq!(calculate_backoff(0, &config).as_millis(), 200);
        assert_eq!(calculate_backoff(1, &config).as_millis(), 600);
        assert_eq!(calculate_backoff(2, &config).as_millis(), 1800);
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: RetryConfig = serde_json::from_str(r#"{ "max_retries": 4 }"#).unwrap();
        assert_eq!(config.max_retries, 4);
        assert_eq!(config.initial_backoff_ms, 1000);
    }

    #[tokio::test]
    async fn test_success_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = retry_connect(
            || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(SshError::ConnectionRefused("127.0.0.1:22".into()))
                    } else {
                        Ok("session")
                    }
                }
            },
            &fast(3),
            "connect",
        )
        .await;

        assert_eq!(result.unwrap(), "session");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_budget_exhausted_reports_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let err = retry_connect(
            || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(SshError::AddressLookup("nowhere.invalid".into()))
                }
            },
            &fast(2),
            "connect",
        )
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.retry_count, Some(3));
        assert_eq!(err.code, ErrorCode::AddressLookup);
        assert_eq!(err.message, "connect: Address lookup failed for host after 3 attempts");
    }

    #[tokio::test]
    async fn test_non_transient_fails_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let err = retry_connect(
            || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(SshError::AuthenticationFailed("rejected by server".into()))
                }
            },
            &fast(5),
            "connect",
        )
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.code, ErrorCode::BadAuth);
        assert_eq!(err.retry_count, Some(1));
        assert_eq!(
            err.message,
            "connect: Authentication failed: rejected by server after 1 attempt"
        );
    }
}
