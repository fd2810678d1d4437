//! Bounded exponential backoff with jitter for remote-store calls.
//!
//! The delay schedule is a pure function of the attempt index so it can be
//! tested directly; the actual waiting goes through a [`Sleeper`] that tests
//! replace with a recorder.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::storage::StoreError;

/// Upper bound of the exponential part of a backoff delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Retry schedule for a single remote-store operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt (before jitter).
    pub base_delay: Duration,
    /// Growth factor between consecutive delays.
    pub factor: f64,
    /// Upper bound of the random jitter added to every delay.
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            factor: 2.0,
            max_jitter: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the failed attempt `attempt` (0-based).
    ///
    /// `jitter` is a sample in `[0, 1)` scaling `max_jitter`; values outside
    /// that range are clamped.
    ///
    /// The exponential part saturates at [`MAX_BACKOFF`].
    pub fn delay_for(&self, attempt: u32, jitter: f64) -> Duration {
        let exp = self.factor.powi(attempt.min(i32::MAX as u32) as i32);
        let base = Duration::try_from_secs_f64(self.base_delay.as_secs_f64() * exp)
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF);
        base.saturating_add(self.max_jitter.mul_f64(jitter.clamp(0.0, 1.0)))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent.  `op` receives the 0-based attempt index.
    ///
    /// On exhaustion the last error is returned along with the number of
    /// attempts made.
    pub async fn run<T, F, Fut>(
        &self,
        sleeper: &dyn Sleeper,
        what: &str,
        mut op: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(err) if !err.is_retryable() => {
                    return Err(RetryError {
                        attempts: attempt + 1,
                        last: err,
                    })
                }
                Err(err) if attempt + 1 >= attempts => {
                    return Err(RetryError {
                        attempts: attempt + 1,
                        last: err,
                    })
                }
                Err(err) => {
                    let delay = self.delay_for(attempt, rand::rng().random::<f64>());
                    warn!(
                        op = what,
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "remote store call failed, backing off"
                    );
                    sleeper.sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// The final error of a retried operation.
#[derive(Debug)]
pub struct RetryError {
    pub attempts: u32,
    pub last: StoreError,
}

/// Waits for a duration.  Injected so tests never sleep for real.
#[async_trait::async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// [`Sleeper`] backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait::async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Records requested delays and returns immediately.
    #[derive(Default)]
    pub(crate) struct RecordingSleeper {
        pub(crate) delays: Mutex<Vec<Duration>>,
    }

    #[async_trait::async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.delays.lock().unwrap().push(duration);
        }
    }

    fn unavailable() -> StoreError {
        StoreError::Unavailable(anyhow::anyhow!("connection reset"))
    }

    #[test]
    fn delay_grows_exponentially_without_jitter() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0, 0.0), Duration::from_millis(200));
        assert_eq!(policy.delay_for(1, 0.0), Duration::from_millis(400));
        assert_eq!(policy.delay_for(2, 0.0), Duration::from_millis(800));
        assert_eq!(policy.delay_for(3, 0.0), Duration::from_millis(1600));
    }

    #[test]
    fn jitter_is_bounded_by_max_jitter() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0, 0.5), Duration::from_millis(300));
        assert_eq!(policy.delay_for(0, 7.0), Duration::from_millis(400));
        assert_eq!(policy.delay_for(0, -1.0), Duration::from_millis(200));
    }

    #[test]
    fn large_attempt_indexes_saturate_instead_of_overflowing() {
        let policy = RetryPolicy {
            max_attempts: 100,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(70, 0.0), MAX_BACKOFF);
        assert_eq!(
            policy.delay_for(u32::MAX, 1.0),
            MAX_BACKOFF + Duration::from_millis(200)
        );

        let steep = RetryPolicy {
            factor: f64::MAX,
            ..RetryPolicy::default()
        };
        assert_eq!(steep.delay_for(3, 0.0), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn many_failed_attempts_end_in_an_error_not_a_panic() {
        let policy = RetryPolicy {
            max_attempts: 100,
            ..RetryPolicy::default()
        };
        let sleeper = RecordingSleeper::default();

        let err = policy
            .run(&sleeper, "restore", |_| async { Err::<(), _>(unavailable()) })
            .await
            .unwrap_err();

        assert_eq!(err.attempts, 100);
        let delays = sleeper.delays.lock().unwrap();
        assert_eq!(delays.len(), 99);
        assert!(delays.iter().all(|d| *d <= MAX_BACKOFF + Duration::from_millis(200)));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let policy = RetryPolicy::default();
        let sleeper = RecordingSleeper::default();
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let result = policy
            .run(&sleeper, "restore", move |_| async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(unavailable())
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let delays = sleeper.delays.lock().unwrap();
        assert_eq!(delays.len(), 2);
        assert!(delays[0] >= Duration::from_millis(200) && delays[0] < Duration::from_millis(400));
        assert!(delays[1] >= Duration::from_millis(400) && delays[1] < Duration::from_millis(600));
    }

    #[tokio::test]
    async fn exhausted_budget_returns_last_error() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        let sleeper = RecordingSleeper::default();

        let err = policy
            .run(&sleeper, "save", |_| async { Err::<(), _>(unavailable()) })
            .await
            .unwrap_err();

        assert_eq!(err.attempts, 3);
        assert!(matches!(err.last, StoreError::Unavailable(_)));
        // No sleep after the final attempt.
        assert_eq!(sleeper.delays.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn conflict_is_not_retried() {
        let policy = RetryPolicy::default();
        let sleeper = RecordingSleeper::default();
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let err = policy
            .run(&sleeper, "save", move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(StoreError::AlreadyExists {
                    key: "ns-cas-abc".to_string(),
                })
            })
            .await
            .unwrap_err();

        assert_eq!(err.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(sleeper.delays.lock().unwrap().is_empty());
    }
}
