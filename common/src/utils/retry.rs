use std::{future::Future, time::Duration};

use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    RetryIf,
};
use tracing::warn;

use crate::{error::AppError, utils::config::AppConfig};

/// Bounded exponential backoff for transient store and model failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            attempts: config.retry_attempts,
            base_delay_ms: config.retry_base_delay_ms,
            max_delay_ms: config.retry_max_delay_ms,
        }
    }

    pub fn none() -> Self {
        Self {
            attempts: 0,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    fn delays(&self) -> impl Iterator<Item = Duration> {
        // from_millis(2) doubles each step; the factor scales the first delay to base.
        ExponentialBackoff::from_millis(2)
            .factor((self.base_delay_ms / 2).max(1))
            .max_delay(Duration::from_millis(self.max_delay_ms.max(1)))
            .map(jitter)
            .take(self.attempts)
    }

    /// Runs `action`, retrying while it fails with a transient error.
    pub async fn run<T, F, Fut>(&self, label: &str, mut action: F) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        RetryIf::start(
            self.delays(),
            || action(),
            |err: &AppError| {
                let transient = err.is_transient();
                if transient {
                    warn!(operation = label, error = %err, "transient failure; retrying");
                }
                transient
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            attempts: 2,
            base_delay_ms: 1,
            max_delay_ms: 2,
        }
    }

    #[tokio::test]
    async fn retries_transient_errors_up_to_the_bound() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), AppError> = fast()
            .run("flaky", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AppError::InternalError("unavailable".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_permanent_errors() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), AppError> = fast()
            .run("invalid", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AppError::Validation("bad input".into()))
            })
            .await;
        assert!(matches!(result, Err(AppError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovers_after_a_transient_failure() {
        let calls = AtomicUsize::new(0);
        let value = fast()
            .run("recovering", || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(AppError::InternalError("blip".into()))
                } else {
                    Ok(7)
                }
            })
            .await
            .expect("second attempt succeeds");
        assert_eq!(value, 7);
    }
}
