// libs/ehr-cell/src/models.rs
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

// ==============================================================================
// ERROR TYPES
// ==============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum EhrError {
    #[error("EHR integration not configured")]
    NotConfigured,

    /// The gateway's admission queue is full; the caller should not wait.
    #[error("EHR gateway saturated")]
    Saturated,

    #[error("EHR rate limit exceeded")]
    RateLimited,

    #[error("EHR server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// The record exists but the EHR has not indexed it yet, or it truly
    /// does not exist. Retryable because of the propagation race.
    #[error("EHR client not found")]
    ClientNotFound,

    #[error("EHR api error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("EHR network error: {0}")]
    Network(String),

    #[error("Failed to decode EHR response: {0}")]
    Decode(String),

    /// The EHR returned an empty or non-numeric identifier after a
    /// successful-looking write. Broken invariant; never swallowed.
    #[error("Invalid EHR client identifier: {0}")]
    InvalidClientId(String),

    /// A local persistence step inside a sync flow failed (alias or client
    /// reference write).
    #[error("Local storage error during EHR sync: {0}")]
    Storage(String),
}

impl EhrError {
    /// Transient failures worth retrying with backoff: rate limiting, server
    /// faults, the not-yet-indexed propagation race, and network errors
    /// (timeouts included).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EhrError::RateLimited
                | EhrError::Server { .. }
                | EhrError::ClientNotFound
                | EhrError::Network(_)
        )
    }
}

impl From<reqwest::Error> for EhrError {
    fn from(err: reqwest::Error) -> Self {
        EhrError::Network(err.to_string())
    }
}

// ==============================================================================
// CLIENT IDENTIFIERS
// ==============================================================================

/// Validated numeric EHR client identifier. The wire shapes the EHR emits are
/// inconsistent (plain number, numeric string, `{"id": …}` wrapper, or a
/// double-encoded JSON string); everything is funneled through
/// [`normalize_client_id`] before use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EhrClientId(String);

impl EhrClientId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EhrClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Normalize a raw identifier value from the EHR to a plain numeric string.
/// Rejected shapes never reach a write that depends on them.
pub fn normalize_client_id(raw: &Value) -> Result<EhrClientId, EhrError> {
    normalize_client_id_inner(raw, 0)
}

fn normalize_client_id_inner(raw: &Value, depth: u8) -> Result<EhrClientId, EhrError> {
    if depth > 2 {
        return Err(EhrError::InvalidClientId(format!(
            "identifier nested too deeply: {}",
            raw
        )));
    }

    match raw {
        Value::Number(n) => {
            if let Some(id) = n.as_u64() {
                return Ok(EhrClientId(id.to_string()));
            }
            Err(EhrError::InvalidClientId(format!(
                "non-integral identifier: {}",
                n
            )))
        }
        Value::String(s) => {
            let trimmed = s.trim();
            if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
                return Ok(EhrClientId(trimmed.to_string()));
            }
            // Double-encoded JSON: "\"123\"" or "{\"id\":123}".
            if let Ok(inner) = serde_json::from_str::<Value>(trimmed) {
                return normalize_client_id_inner(&inner, depth + 1);
            }
            Err(EhrError::InvalidClientId(format!(
                "non-numeric identifier: {:?}",
                s
            )))
        }
        Value::Object(map) => {
            let inner = map
                .get("id")
                .or_else(|| map.get("client_id"))
                .ok_or_else(|| {
                    EhrError::InvalidClientId(format!("wrapper without id field: {}", raw))
                })?;
            normalize_client_id_inner(inner, depth + 1)
        }
        other => Err(EhrError::InvalidClientId(format!(
            "unsupported identifier shape: {}",
            other
        ))),
    }
}

// ==============================================================================
// EHR RECORD MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EhrClientRecord {
    /// Raw identifier as sent by the EHR; normalize before use.
    pub id: Value,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    /// The EHR serializes dates as `YYYY-MM-DD` strings.
    pub date_of_birth: Option<String>,
    pub member_id: Option<String>,
    pub group_number: Option<String>,
    pub notes: Option<String>,
}

impl EhrClientRecord {
    pub fn client_id(&self) -> Result<EhrClientId, EhrError> {
        normalize_client_id(&self.id)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateEhrClientRequest {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_of_birth: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub member_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ClientSearchQuery {
    pub email: Option<String>,
    pub last_name: Option<String>,
    pub date_of_birth: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EhrAppointment {
    pub id: Option<Value>,
    pub client_id: Option<Value>,
    pub provider_ref: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateEhrAppointmentRequest {
    pub client_id: String,
    pub provider_ref: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub service_name: String,
    pub location_mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Insurance and contact enrichment carried alongside a booking request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InsuranceEnrichment {
    pub member_id: Option<String>,
    pub group_number: Option<String>,
    pub case_manager_note: Option<String>,
}

// ==============================================================================
// SYNC AUDIT MODELS
// ==============================================================================

/// Which matching tier fired during an upsert, recorded for forensics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    Strong,
    Fallback,
    NoMatch,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    SearchClients,
    CreateClient,
    EnrichClient,
    DuplicateDetected,
    VerifyPropagation,
    CreateAppointment,
    SendQuestionnaire,
}

impl fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncOperation::SearchClients => "search_clients",
            SyncOperation::CreateClient => "create_client",
            SyncOperation::EnrichClient => "enrich_client",
            SyncOperation::DuplicateDetected => "duplicate_detected",
            SyncOperation::VerifyPropagation => "verify_propagation",
            SyncOperation::CreateAppointment => "create_appointment",
            SyncOperation::SendQuestionnaire => "send_questionnaire",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Success,
    Failure,
    Skipped,
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOutcome::Success => write!(f, "success"),
            SyncOutcome::Failure => write!(f, "failure"),
            SyncOutcome::Skipped => write!(f, "skipped"),
        }
    }
}

/// One append-only row per attempted external-system operation.
#[derive(Debug, Clone, Serialize)]
pub struct NewSyncAudit {
    pub patient_id: Option<Uuid>,
    pub reservation_id: Option<Uuid>,
    pub operation: SyncOperation,
    pub outcome: SyncOutcome,
    pub match_tier: Option<MatchTier>,
    pub request_payload: Option<Value>,
    pub response_payload: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: i64,
}

/// Expected EHR date format.
pub fn format_ehr_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn normalizes_plain_number() {
        let id = normalize_client_id(&json!(4182)).unwrap();
        assert_eq!(id.as_str(), "4182");
    }

    #[test]
    fn normalizes_numeric_string() {
        let id = normalize_client_id(&json!(" 4182 ")).unwrap();
        assert_eq!(id.as_str(), "4182");
    }

    #[test]
    fn normalizes_object_wrapper() {
        let id = normalize_client_id(&json!({"id": 4182})).unwrap();
        assert_eq!(id.as_str(), "4182");

        let id = normalize_client_id(&json!({"client_id": "77"})).unwrap();
        assert_eq!(id.as_str(), "77");
    }

    #[test]
    fn normalizes_double_encoded_json() {
        let id = normalize_client_id(&json!("\"4182\"")).unwrap();
        assert_eq!(id.as_str(), "4182");

        let id = normalize_client_id(&json!("{\"id\": 4182}")).unwrap();
        assert_eq!(id.as_str(), "4182");
    }

    #[test]
    fn rejects_invalid_shapes() {
        assert_matches!(
            normalize_client_id(&json!("")),
            Err(EhrError::InvalidClientId(_))
        );
        assert_matches!(
            normalize_client_id(&json!("abc")),
            Err(EhrError::InvalidClientId(_))
        );
        assert_matches!(
            normalize_client_id(&json!(null)),
            Err(EhrError::InvalidClientId(_))
        );
        assert_matches!(
            normalize_client_id(&json!({"name": "no id"})),
            Err(EhrError::InvalidClientId(_))
        );
        assert_matches!(
            normalize_client_id(&json!(12.5)),
            Err(EhrError::InvalidClientId(_))
        );
    }

    #[test]
    fn retryable_classification() {
        assert!(EhrError::RateLimited.is_retryable());
        assert!(EhrError::ClientNotFound.is_retryable());
        assert!(EhrError::Server { status: 503, message: String::new() }.is_retryable());
        assert!(EhrError::Network("timeout".into()).is_retryable());
        assert!(!EhrError::Api { status: 422, message: String::new() }.is_retryable());
        assert!(!EhrError::InvalidClientId(String::new()).is_retryable());
        assert!(!EhrError::Saturated.is_retryable());
    }
}
