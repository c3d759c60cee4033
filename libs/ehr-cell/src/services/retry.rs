// libs/ehr-cell/src/services/retry.rs
//
// Backoff policy value object plus a small retry driver. The sleep side is a
// trait so tests can assert on the bound and the delay curve without waiting.

use async_trait::async_trait;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use shared_config::AppConfig;

use crate::models::EhrError;

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
    pub jitter: Duration,
}

impl BackoffPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.ehr_backoff_base_ms),
            multiplier: 2.0,
            max_attempts: config.ehr_max_attempts.max(1),
            jitter: Duration::from_millis(config.ehr_backoff_base_ms / 4),
        }
    }

    /// Delay before retrying after the given (1-based) failed attempt:
    /// `base * multiplier^(attempt - 1)` plus random jitter.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent as i32);
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        Duration::from_secs_f64(scaled) + jitter
    }
}

#[async_trait]
pub trait Sleep: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleep;

#[async_trait]
impl Sleep for TokioSleep {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Drive a fallible async operation under the policy. Only errors classified
/// retryable are retried; the last error is returned once attempts run out.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &BackoffPolicy,
    sleep: &dyn Sleep,
    operation: &str,
    mut f: F,
) -> Result<T, EhrError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, EhrError>>,
{
    let mut attempt = 1;
    loop {
        match f(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{} succeeded on attempt {}", operation, attempt);
                }
                return Ok(value);
            }
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_after(attempt);
                warn!(
                    "{} failed on attempt {}/{} ({}), retrying in {:?}",
                    operation, attempt, policy.max_attempts, err, delay
                );
                sleep.sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                warn!(
                    "{} failed permanently on attempt {}/{}: {}",
                    operation, attempt, policy.max_attempts, err
                );
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    pub struct RecordingSleep {
        pub delays: Mutex<Vec<Duration>>,
    }

    impl RecordingSleep {
        fn new() -> Self {
            Self {
                delays: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Sleep for RecordingSleep {
        async fn sleep(&self, duration: Duration) {
            self.delays.lock().await.push(duration);
        }
    }

    fn policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_attempts,
            jitter: Duration::ZERO,
        }
    }

    #[test]
    fn delay_curve_doubles() {
        let p = policy(4);
        assert_eq!(p.delay_after(1), Duration::from_millis(100));
        assert_eq!(p.delay_after(2), Duration::from_millis(200));
        assert_eq!(p.delay_after(3), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn retries_exactly_max_attempts_with_increasing_delays() {
        let sleep = RecordingSleep::new();
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = Arc::clone(&attempts);

        let result: Result<(), EhrError> =
            retry_with_backoff(&policy(4), &sleep, "create_appointment", |_| {
                let attempts = Arc::clone(&attempts_clone);
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(EhrError::RateLimited)
                }
            })
            .await;

        assert_matches!(result, Err(EhrError::RateLimited));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);

        let delays = sleep.delays.lock().await;
        assert_eq!(delays.len(), 3);
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn non_retryable_error_fails_immediately() {
        let sleep = RecordingSleep::new();
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = Arc::clone(&attempts);

        let result: Result<(), EhrError> =
            retry_with_backoff(&policy(4), &sleep, "create_client", |_| {
                let attempts = Arc::clone(&attempts_clone);
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(EhrError::Api {
                        status: 422,
                        message: "bad payload".to_string(),
                    })
                }
            })
            .await;

        assert_matches!(result, Err(EhrError::Api { status: 422, .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(sleep.delays.lock().await.is_empty());
    }

    #[tokio::test]
    async fn transient_failure_then_success() {
        let sleep = RecordingSleep::new();

        let result = retry_with_backoff(&policy(4), &sleep, "get_client", |attempt| async move {
            if attempt < 3 {
                Err(EhrError::ClientNotFound)
            } else {
                Ok(attempt)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(sleep.delays.lock().await.len(), 2);
    }
}
