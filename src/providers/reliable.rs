//! Retry wrapper for transient backend failures.
//!
//! Authentication and unknown failures are returned immediately; only
//! [`ProviderError::Transient`] is retried, with exponential backoff.

use super::error::ProviderError;
use super::traits::{ChatMessage, GenerationOptions, Provider};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Retry policy for [`ReliableProvider`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Extra attempts after the first one. `0` disables retrying.
    pub max_retries: u32,
    /// Delay before the first retry; doubles with each further retry.
    pub base_backoff: Duration,
    /// Upper bound for a single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    fn backoff_delay(&self, attempt: u32) -> Duration {
        self.base_backoff
            .saturating_mul(2_u32.saturating_pow(attempt))
            .min(self.max_backoff)
    }
}

pub struct ReliableProvider {
    inner: Arc<dyn Provider>,
    policy: RetryPolicy,
}

impl ReliableProvider {
    pub fn new(inner: Arc<dyn Provider>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl Provider for ReliableProvider {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<String, ProviderError> {
        let mut attempt = 0;
        loop {
            match self.inner.generate(messages, options).await {
                Ok(text) => {
                    if attempt > 0 {
                        tracing::info!(
                            provider = self.inner.name(),
                            attempt = attempt + 1,
                            "Provider recovered after retries"
                        );
                    }
                    return Ok(text);
                }
                Err(err) if err.is_retryable() && attempt < self.policy.max_retries => {
                    let delay = self.policy.backoff_delay(attempt);
                    tracing::warn!(
                        provider = self.inner.name(),
                        attempt = attempt + 1,
                        max_retries = self.policy.max_retries,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "Provider call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn health_check(&self) -> bool {
        self.inner.health_check().await
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
