// libs/ehr-cell/src/services/audit.rs
//
// Append-only sync audit log: one row per attempted external-system
// operation. Best-effort by design; an audit write failure must never fail
// the request it describes.

use chrono::Utc;
use reqwest::Method;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

use shared_database::StoreClient;

use crate::models::{NewSyncAudit, SyncOperation, SyncOutcome};

pub struct SyncAuditService {
    store: Arc<StoreClient>,
}

impl SyncAuditService {
    pub fn new(store: Arc<StoreClient>) -> Self {
        Self { store }
    }

    pub async fn record(&self, entry: NewSyncAudit) {
        let row = json!({
            "patient_id": entry.patient_id,
            "reservation_id": entry.reservation_id,
            "operation": entry.operation.to_string(),
            "outcome": entry.outcome.to_string(),
            "match_tier": entry.match_tier,
            "request_payload": entry.request_payload,
            "response_payload": entry.response_payload,
            "error": entry.error,
            "duration_ms": entry.duration_ms,
            "created_at": Utc::now().to_rfc3339(),
        });

        let result: Result<Value, _> = self
            .store
            .request(Method::POST, "/rest/v1/sync_audit_log", Some(row))
            .await;

        match result {
            Ok(_) => debug!(
                "Sync audit recorded: {} {}",
                entry.operation, entry.outcome
            ),
            Err(e) => error!("Failed to record sync audit row: {}", e),
        }
    }

    /// Convenience for the common success/failure pattern around one call.
    pub async fn record_operation(
        &self,
        patient_id: Option<Uuid>,
        reservation_id: Option<Uuid>,
        operation: SyncOperation,
        result_error: Option<String>,
        request_payload: Option<Value>,
        response_payload: Option<Value>,
        duration_ms: i64,
    ) {
        let outcome = if result_error.is_none() {
            SyncOutcome::Success
        } else {
            SyncOutcome::Failure
        };
        self.record(NewSyncAudit {
            patient_id,
            reservation_id,
            operation,
            outcome,
            match_tier: None,
            request_payload,
            response_payload,
            error: result_error,
            duration_ms,
        })
        .await;
    }
}
