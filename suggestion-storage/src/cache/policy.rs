//! Timeout and bounded retry around backend calls.

use std::future::Future;
use std::time::Duration;

use suggestion_core::{RetryConfig, StoreError};

use super::config::CacheConfig;

/// Applies the point timeout to every attempt and retries transient
/// failures with exponential backoff.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    point_timeout: Duration,
    retry: RetryConfig,
}

impl CachePolicy {
    pub fn new(point_timeout: Duration, retry: RetryConfig) -> Self {
        Self {
            point_timeout,
            retry,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.point_timeout, config.retry.clone())
    }

    /// Run `call` until it succeeds, fails permanently, or the retry budget
    /// is spent. A timed-out attempt counts as a transient failure.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0u32;
        loop {
            let result = match tokio::time::timeout(self.point_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout {
                    operation,
                    after: self.point_timeout,
                }),
            };

            match result {
                Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                    let backoff = self.retry.backoff_for(attempt);
                    tracing::debug!(
                        operation,
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Retrying cache operation"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_retries: u32) -> CachePolicy {
        CachePolicy::new(
            Duration::from_millis(50),
            RetryConfig {
                max_retries,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                backoff_multiplier: 2.0,
            },
        )
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = fast_policy(3)
            .run("set_members", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StoreError::Connection {
                        reason: "reset".to_string(),
                    })
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), StoreError> = fast_policy(2)
            .run("hash_set", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Connection {
                    reason: "down".to_string(),
                })
            })
            .await;
        assert!(matches!(result, Err(StoreError::Connection { .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), StoreError> = fast_policy(3)
            .run("hash_get_all", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Serialization {
                    reason: "eof".to_string(),
                })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_call_times_out() {
        let result: Result<(), StoreError> = fast_policy(0)
            .run("sorted_range", || async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(())
            })
            .await;
        assert!(matches!(
            result,
            Err(StoreError::Timeout {
                operation: "sorted_range",
                ..
            })
        ));
    }
}
