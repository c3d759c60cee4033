// libs/booking-cell/src/services/idempotency.rs
//
// Key to stored-response mapping. The uniqueness constraint on the key is the
// linearization point: whichever concurrent request inserts first owns the
// externally visible booking; the loser answers with the winner's response.

use chrono::Utc;
use reqwest::Method;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use shared_database::{StoreClient, StoreError};

use crate::models::{BookingError, IdempotencyRecord};

pub struct IdempotencyService {
    store: Arc<StoreClient>,
}

impl IdempotencyService {
    pub fn new(store: Arc<StoreClient>) -> Self {
        Self { store }
    }

    /// Stored response for a key, if one exists. Replays must not re-execute
    /// any side effect.
    pub async fn find(&self, key: &str) -> Result<Option<IdempotencyRecord>, BookingError> {
        let path = format!(
            "/rest/v1/idempotency_records?key=eq.{}",
            urlencoding::encode(key)
        );
        let rows: Vec<IdempotencyRecord> = self.store.request(Method::GET, &path, None).await?;
        Ok(rows.into_iter().next())
    }

    /// Persist the finished response under the key. Returns the winner's
    /// stored response when a concurrent request got there first; any other
    /// persistence failure is logged and swallowed because the booking
    /// itself already succeeded.
    pub async fn persist(
        &self,
        key: &str,
        reservation_id: Uuid,
        response: &Value,
    ) -> Option<Value> {
        let body = json!({
            "key": key,
            "reservation_id": reservation_id,
            "response": response,
            "created_at": Utc::now().to_rfc3339(),
        });

        let result: Result<IdempotencyRecord, StoreError> = self
            .store
            .insert_returning("/rest/v1/idempotency_records", body)
            .await;

        match result {
            Ok(_) => {
                debug!("Idempotency record persisted for key {}", key);
                None
            }
            Err(StoreError::Conflict(_)) => {
                warn!(
                    "Lost idempotency insert race for key {}; returning winner's response",
                    key
                );
                match self.find(key).await {
                    Ok(Some(winner)) => Some(winner.response),
                    Ok(None) => {
                        warn!("Idempotency conflict for key {} but no stored row found", key);
                        None
                    }
                    Err(e) => {
                        warn!("Failed to fetch winning idempotency record: {}", e);
                        None
                    }
                }
            }
            Err(e) => {
                warn!("Failed to persist idempotency record for key {}: {}", key, e);
                None
            }
        }
    }
}
