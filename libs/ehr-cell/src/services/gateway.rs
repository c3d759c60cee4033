// libs/ehr-cell/src/services/gateway.rs
//
// Every outbound EHR call, from any concurrent booking, flows through this
// single shared limiter: a token bucket for sustained rate, a bounded
// admission queue that fails fast when full, and a hard cap on in-flight
// calls. Constructed once at process start and injected.

use std::future::Future;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use shared_config::AppConfig;

use crate::models::EhrError;

struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_second: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill_per_second: f64) -> Self {
        Self {
            capacity: capacity.max(1) as f64,
            tokens: capacity.max(1) as f64,
            refill_per_second: refill_per_second.max(0.001),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * self.refill_per_second).min(self.capacity);
        self.last_refill = now;
    }

    /// Take a token, or report how long until one is available.
    fn try_take(&mut self, now: Instant) -> Option<Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return None;
        }
        let deficit = 1.0 - self.tokens;
        Some(Duration::from_secs_f64(deficit / self.refill_per_second))
    }
}

pub struct RateLimitedGateway {
    bucket: Mutex<TokenBucket>,
    /// Bounded admission queue; requests beyond this fail with `Saturated`.
    queue_slots: Semaphore,
    /// Hard cap on concurrently in-flight EHR calls.
    in_flight: Semaphore,
}

impl RateLimitedGateway {
    pub fn new(burst: u32, refill_per_second: f64, max_concurrent: u32, queue_depth: u32) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(burst, refill_per_second)),
            queue_slots: Semaphore::new(queue_depth as usize),
            in_flight: Semaphore::new(max_concurrent.max(1) as usize),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.ehr_rate_limit_burst,
            config.ehr_rate_limit_per_second,
            config.ehr_max_concurrent,
            config.ehr_queue_depth,
        )
    }

    /// Run one EHR call under the limiter. Admission is fail-fast: when the
    /// queue is full the caller gets `Saturated` instead of blocking
    /// indefinitely.
    pub async fn run<T, F, Fut>(&self, f: F) -> Result<T, EhrError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, EhrError>>,
    {
        let queue_slot = match self.queue_slots.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                warn!("EHR gateway queue full, rejecting request");
                return Err(EhrError::Saturated);
            }
        };

        let in_flight = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| EhrError::Saturated)?;

        // Wait for a rate token while still counted against the queue bound.
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                bucket.try_take(Instant::now())
            };
            match wait {
                None => break,
                Some(delay) => {
                    debug!("EHR gateway throttling for {:?}", delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }

        // Admitted: free the queue slot before the (possibly slow) call.
        drop(queue_slot);

        let result = f().await;
        drop(in_flight);
        result
    }
}
