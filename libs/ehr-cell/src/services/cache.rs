// libs/ehr-cell/src/services/cache.rs
//
// Short-TTL read-through cache for external appointment queries, keyed by
// (provider, date). Entries are advisory: concurrent fetches for the same key
// may race and last write wins, and a stale entry is preferred over failing
// the caller when the upstream read errors.

use chrono::NaiveDate;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use shared_config::AppConfig;

use crate::models::{EhrAppointment, EhrError};

type CacheKey = (Uuid, NaiveDate);

struct CacheEntry {
    appointments: Vec<EhrAppointment>,
    fetched_at: Instant,
}

pub struct AppointmentReadCache {
    ttl: Duration,
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
}

impl AppointmentReadCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(Duration::from_secs(config.ehr_cache_ttl_seconds))
    }

    /// Serve from cache when fresh; otherwise fetch and repopulate. On
    /// upstream error any cached entry, fresh or stale, is returned instead
    /// of surfacing the failure.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        provider_id: Uuid,
        date: NaiveDate,
        fetch: F,
    ) -> Result<Vec<EhrAppointment>, EhrError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<EhrAppointment>, EhrError>>,
    {
        let key = (provider_id, date);

        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(&key) {
                if entry.fetched_at.elapsed() < self.ttl {
                    debug!("Appointment cache hit for provider {} on {}", provider_id, date);
                    return Ok(entry.appointments.clone());
                }
            }
        }

        match fetch().await {
            Ok(appointments) => {
                let mut entries = self.entries.write().await;
                // Sweep entries stale past the error-fallback grace window,
                // so the map stays bounded by recently queried keys.
                let horizon = self.ttl.saturating_mul(2);
                entries.retain(|k, entry| *k == key || entry.fetched_at.elapsed() <= horizon);
                entries.insert(
                    key,
                    CacheEntry {
                        appointments: appointments.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                Ok(appointments)
            }
            Err(err) => {
                let entries = self.entries.read().await;
                if let Some(entry) = entries.get(&key) {
                    warn!(
                        "EHR appointment read failed ({}), serving stale cache for provider {} on {}",
                        err, provider_id, date
                    );
                    return Ok(entry.appointments.clone());
                }
                Err(err)
            }
        }
    }

    /// Drop an entry after a write invalidates it.
    pub async fn invalidate(&self, provider_id: Uuid, date: NaiveDate) {
        let mut entries = self.entries.write().await;
        entries.remove(&(provider_id, date));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn sample_appointments() -> Vec<EhrAppointment> {
        vec![EhrAppointment {
            id: Some(serde_json::json!(1)),
            client_id: Some(serde_json::json!(9)),
            provider_ref: Some("prov-1".to_string()),
            start_time: Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap(),
            end_time: Utc.with_ymd_and_hms(2026, 3, 2, 10, 30, 0).unwrap(),
            status: Some("booked".to_string()),
        }]
    }

    #[tokio::test]
    async fn fresh_entry_skips_upstream() {
        let cache = AppointmentReadCache::new(Duration::from_secs(60));
        let provider = Uuid::new_v4();
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            let result = cache
                .get_or_fetch(provider, date, || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(sample_appointments())
                })
                .await
                .unwrap();
            assert_eq!(result.len(), 1);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_entry_served_on_upstream_error() {
        // Zero TTL: the entry is stale as soon as it is written.
        let cache = AppointmentReadCache::new(Duration::ZERO);
        let provider = Uuid::new_v4();
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();

        cache
            .get_or_fetch(provider, date, || async { Ok(sample_appointments()) })
            .await
            .unwrap();

        let result = cache
            .get_or_fetch(provider, date, || async {
                Err(EhrError::Server {
                    status: 503,
                    message: "unavailable".to_string(),
                })
            })
            .await
            .unwrap();

        assert_eq!(result.len(), 1);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn population_sweeps_entries_past_the_grace_window() {
        let cache = AppointmentReadCache::new(Duration::from_secs(60));
        let old_provider = Uuid::new_v4();
        let other_provider = Uuid::new_v4();
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();

        cache
            .get_or_fetch(old_provider, date, || async { Ok(sample_appointments()) })
            .await
            .unwrap();

        // Well past twice the TTL: the next successful population for any
        // other key evicts the old entry.
        tokio::time::advance(Duration::from_secs(300)).await;
        cache
            .get_or_fetch(other_provider, date, || async { Ok(Vec::new()) })
            .await
            .unwrap();

        // With the old entry gone there is no stale fallback left to serve.
        let result = cache
            .get_or_fetch(old_provider, date, || async { Err(EhrError::RateLimited) })
            .await;
        assert!(matches!(result, Err(EhrError::RateLimited)));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn recently_stale_entry_survives_the_sweep() {
        let cache = AppointmentReadCache::new(Duration::from_secs(60));
        let stale_provider = Uuid::new_v4();
        let other_provider = Uuid::new_v4();
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();

        cache
            .get_or_fetch(stale_provider, date, || async { Ok(sample_appointments()) })
            .await
            .unwrap();

        // Stale but inside the grace window; the sweep keeps it around as an
        // error fallback.
        tokio::time::advance(Duration::from_secs(90)).await;
        cache
            .get_or_fetch(other_provider, date, || async { Ok(Vec::new()) })
            .await
            .unwrap();

        let result = cache
            .get_or_fetch(stale_provider, date, || async {
                Err(EhrError::Server {
                    status: 503,
                    message: "unavailable".to_string(),
                })
            })
            .await
            .unwrap();
        assert_eq!(result.len(), 1);
    }

    #[tokio::test]
    async fn error_with_no_cached_entry_propagates() {
        let cache = AppointmentReadCache::new(Duration::from_secs(60));
        let provider = Uuid::new_v4();
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();

        let result = cache
            .get_or_fetch(provider, date, || async { Err(EhrError::RateLimited) })
            .await;

        assert!(matches!(result, Err(EhrError::RateLimited)));
    }
}
