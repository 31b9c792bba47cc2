// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2025 Comfygate Contributors

//! HTTP client utilities
//!
//! Two client profiles: a control-plane client with bounded timeouts for
//! engine calls and webhooks, and a transfer client with request timeouts
//! disabled because model downloads and uploads can run arbitrarily long.
//! `execute_with_retry` wraps transient failures with exponential backoff.

use std::time::Duration;

use reqwest::Client;
use tokio::time::sleep;

use crate::error::{GatewayError, Result};

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Request timeout for control-plane calls
    pub timeout: Duration,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Retry settings for transient errors
    pub retry: RetryConfig,
}

/// Retry/backoff settings
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries
    pub max_retries: u32,
    /// Base delay for exponential backoff
    pub base_delay: Duration,
    /// Cap on the delay between retries
    pub max_delay: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl HttpClientConfig {
    /// Create the control-plane client with configured timeouts
    pub fn create_client(&self) -> Result<Client> {
        Client::builder()
            .timeout(self.timeout)
            .connect_timeout(self.connect_timeout)
            .build()
            .map_err(|e| GatewayError::Internal {
                message: format!("failed to create HTTP client: {e}"),
            })
    }

    /// Create the transfer client: no request timeout, long transfers allowed
    pub fn create_transfer_client(&self) -> Result<Client> {
        Client::builder()
            .connect_timeout(self.connect_timeout)
            .build()
            .map_err(|e| GatewayError::Internal {
                message: format!("failed to create transfer client: {e}"),
            })
    }
}

/// Execute a request-producing closure with retry on transient failures
pub async fn execute_with_retry<F, T>(retry: &RetryConfig, mut request_fn: F) -> Result<T>
where
    F: FnMut() -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<T>> + Send>>,
{
    let mut attempt = 0;

    loop {
        match request_fn().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                if attempt >= retry.max_retries || !is_retryable(&err) {
                    return Err(err);
                }

                attempt += 1;
                let delay = backoff_delay(attempt, retry);
                tracing::debug!(
                    attempt,
                    max = retry.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after transient failure: {err}"
                );
                sleep(delay).await;
            }
        }
    }
}

/// Transient failures worth retrying: 429, 5xx, and transport errors
fn is_retryable(err: &GatewayError) -> bool {
    match err {
        GatewayError::Network { .. } => true,
        GatewayError::Api { status, .. } => match status {
            Some(429) => true,
            Some(s) => *s >= 500,
            None => false,
        },
        _ => false,
    }
}

/// Exponential backoff with jitter, capped at `max_delay`
fn backoff_delay(attempt: u32, retry: &RetryConfig) -> Duration {
    use rand::Rng;

    let exponential = retry.base_delay.as_millis() as u64 * 2u64.saturating_pow(attempt);
    let capped = exponential.min(retry.max_delay.as_millis() as u64);
    let jitter = rand::thread_rng().gen_range(0..=(capped / 4).max(1));

    Duration::from_millis(capped + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_config_default() {
        let config = HttpClientConfig::default();
        assert_eq!(config.timeout.as_secs(), 120);
        assert_eq!(config.connect_timeout.as_secs(), 30);
        assert_eq!(config.retry.max_retries, 3);
    }

    #[test]
    fn test_create_clients() {
        let config = HttpClientConfig::default();
        assert!(config.create_client().is_ok());
        assert!(config.create_transfer_client().is_ok());
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable(&GatewayError::Api {
            message: "rate limited".to_string(),
            status: Some(429),
        }));
        assert!(is_retryable(&GatewayError::Api {
            message: "bad gateway".to_string(),
            status: Some(502),
        }));
        assert!(!is_retryable(&GatewayError::Api {
            message: "bad request".to_string(),
            status: Some(400),
        }));
        assert!(!is_retryable(&GatewayError::validation("nope")));
        assert!(is_retryable(&GatewayError::Network {
            message: "connection reset".to_string(),
            source: None,
        }));
    }

    #[test]
    fn test_backoff_delay_grows_and_caps() {
        let retry = RetryConfig::default();
        let d1 = backoff_delay(1, &retry);
        assert!(d1.as_millis() >= 2_000);
        let d_high = backoff_delay(10, &retry);
        // 30s cap plus up to 25% jitter
        assert!(d_high.as_millis() <= 37_500 + 1);
    }

    #[tokio::test]
    async fn test_execute_with_retry_succeeds_after_transient() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let attempts = Arc::new(AtomicU32::new(0));
        let retry = RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };

        let counter = attempts.clone();
        let result = execute_with_retry(&retry, move || {
            let counter = counter.clone();
            Box::pin(async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(GatewayError::Network {
                        message: "flaky".to_string(),
                        source: None,
                    })
                } else {
                    Ok(42u32)
                }
            })
        })
        .await;

        assert_eq!(result.ok(), Some(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_execute_with_retry_gives_up_on_permanent() {
        let retry = RetryConfig::default();
        let result: Result<()> = execute_with_retry(&retry, || {
            Box::pin(async { Err(GatewayError::validation("permanent")) })
        })
        .await;
        assert!(result.is_err());
    }
}
