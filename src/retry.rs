//! Bounded exponential-backoff retry.
//!
//! Backoff schedule for attempt `n` (0-based) is `base_delay × 2^n`, so with the
//! default 1s base the waits are 1s, 2s, 4s. Only failures whose
//! [`FailureKind`] is in the configured retryable set are retried; everything
//! else (401, other 4xx, validation, decode) is returned on the first attempt.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::{ApiError, ApiResult, FailureKind};

/// Upper bound on the backoff exponent.
const MAX_BACKOFF_SHIFT: u32 = 16;

#[derive(Debug, Clone)]
pub struct RetryHandler {
    max_retries: u32,
    base_delay: Duration,
    retry_on: HashSet<FailureKind>,
}

impl RetryHandler {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            retry_on: [
                FailureKind::Timeout,
                FailureKind::ConnectionReset,
                FailureKind::ServerError,
            ]
            .into_iter()
            .collect(),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            retry_on: config.retry_on.iter().copied().collect(),
        }
    }

    /// Restrict retries to the given failure classes.
    pub fn retry_on(mut self, kinds: impl IntoIterator<Item = FailureKind>) -> Self {
        self.retry_on = kinds.into_iter().collect();
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before retry number `attempt + 1`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(1u32 << attempt.min(MAX_BACKOFF_SHIFT))
    }

    pub fn should_retry(&self, err: &ApiError) -> bool {
        err.failure_kind()
            .is_some_and(|kind| self.retry_on.contains(&kind))
    }

    /// Run `op` until it succeeds, fails permanently, or retries run out.
    ///
    /// `op` receives the 0-based attempt number. Attempts never overlap. The
    /// error of the last attempt is returned unchanged.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> ApiResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = ApiResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_retries && self.should_retry(&err) => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryHandler {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn timeout() -> ApiError {
        ApiError::Transport {
            kind: TransportErrorKind::Timeout,
            message: "timed out".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_fourth_attempt() {
        let handler = RetryHandler::new(3, Duration::from_millis(100));
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let counter = calls.clone();
        let result = handler
            .run(move |_| {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 4 {
                        Err(timeout())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(start.elapsed() >= Duration::from_millis(100 + 200 + 400));
    }

    #[tokio::test(start_paused = true)]
    async fn non_transient_fails_immediately() {
        let handler = RetryHandler::new(3, Duration::from_millis(100));
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result: ApiResult<()> = handler
            .run(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(ApiError::from_status(400, "bad input")) }
            })
            .await;

        assert!(matches!(result, Err(ApiError::Client { status: 400, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_is_not_retried() {
        let handler = RetryHandler::new(3, Duration::from_millis(10));
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result: ApiResult<()> = handler
            .run(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(ApiError::AuthExpired) }
            })
            .await;

        assert!(matches!(result, Err(ApiError::AuthExpired)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_return_last_error() {
        let handler = RetryHandler::new(2, Duration::from_millis(10));
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result: ApiResult<()> = handler
            .run(move |attempt| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    Err(ApiError::Server {
                        status: 500 + attempt as u16,
                        body: String::new(),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(ApiError::Server { status: 502, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn excluded_kind_is_not_retried() {
        let handler =
            RetryHandler::new(3, Duration::from_millis(10)).retry_on([FailureKind::ServerError]);
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result: ApiResult<()> = handler
            .run(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(timeout()) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_doubles() {
        let handler = RetryHandler::new(3, Duration::from_millis(1000));
        assert_eq!(handler.delay_for(0), Duration::from_millis(1000));
        assert_eq!(handler.delay_for(1), Duration::from_millis(2000));
        assert_eq!(handler.delay_for(2), Duration::from_millis(4000));
    }
}
