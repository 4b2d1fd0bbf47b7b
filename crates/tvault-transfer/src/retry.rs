//! Bounded retry for rate-limited remote calls
//!
//! Only `VaultError::RateLimited` is retried. The sleep before retry `n`
//! (1-based) is `max(wait, min(base * 2^(n-1), max_delay))`: never shorter
//! than the server-mandated cool-down, otherwise exponential up to a cap.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;
use tvault_core::config::TransferConfig;
use tvault_core::{VaultError, VaultResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; 0 disables retrying
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&TransferConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &TransferConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            base_delay: Duration::from_millis(cfg.retry_base_delay_ms),
            max_delay: Duration::from_millis(cfg.retry_max_delay_ms),
        }
    }

    /// Sleep before retry number `retry` (1-based) given the server's wait.
    pub fn delay_for(&self, retry: u32, server_wait: Duration) -> Duration {
        let exp = retry.saturating_sub(1).min(31);
        let backoff = self
            .base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        backoff.max(server_wait)
    }

    /// Run `call` until it succeeds, fails with a non-retryable error, runs
    /// out of retries, or `cancel` fires.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        mut call: F,
    ) -> VaultResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = VaultResult<T>>,
    {
        let mut retries = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(VaultError::Cancelled);
            }
            let wait = match call().await {
                Err(VaultError::RateLimited { wait }) => wait,
                other => return other,
            };
            if retries >= self.max_retries {
                return Err(VaultError::RetriesExhausted {
                    operation: operation.to_string(),
                    attempts: retries + 1,
                });
            }
            retries += 1;
            let delay = self.delay_for(retries, wait);
            warn!(
                operation,
                attempt = retries,
                delay_ms = delay.as_millis() as u64,
                "rate limited, backing off"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(VaultError::Cancelled),
            }
        }
    }
}
