use crate::constants::{DEFAULT_RETRIES, DEFAULT_RETRY_BASE_DELAY, DEFAULT_RETRY_MAX_JITTER};
use crate::transport::{BufferedReply, ChatRequestBody, ChatTransport};
use crate::types::{ChatError, ObservedError, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Exponential backoff for buffered requests. `retries` counts the extra
/// attempts after the first one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            base_delay: DEFAULT_RETRY_BASE_DELAY,
            max_jitter: DEFAULT_RETRY_MAX_JITTER,
        }
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, base_delay: Duration) -> Self {
        Self {
            retries,
            base_delay,
            ..Self::default()
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.max_jitter = Duration::ZERO;
        self
    }

    /// Delay before retry number `retry` (0-based): `base * 2^retry` plus jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        let base = self.base_delay.saturating_mul(factor);
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(fastrand::u64(0..jitter_ms))
        } else {
            Duration::ZERO
        };
        base.saturating_add(jitter)
    }

    pub async fn execute_with_retry<F, Fut, T>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retry = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(ChatError::Aborted.into());
            }
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ChatError::Aborted.into()),
                r = operation() => r,
            };
            match outcome {
                Ok(val) => return Ok(val),
                Err(e) if retry < self.retries && self.is_retryable(&e) => {
                    let delay = self.delay_for(retry);
                    retry += 1;
                    tracing::warn!(
                        "Request failed (attempt {}/{}): {}. Retrying in {:?}...",
                        retry,
                        self.retries + 1,
                        e,
                        delay
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(ChatError::Aborted.into()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn is_retryable(&self, err: &ObservedError) -> bool {
        err.inner.is_network()
    }
}

/// Buffered request with retries. Server-reported errors in a successful
/// response are returned as-is on the first attempt.
pub async fn fetch_with_retry(
    transport: &dyn ChatTransport,
    body: &ChatRequestBody,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<BufferedReply> {
    policy
        .execute_with_retry(cancel, || transport.send_buffered(body))
        .await
}
