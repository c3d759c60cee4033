// libs/booking-cell/src/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use ehr_cell::models::InsuranceEnrichment;
use patient_cell::models::{PatientError, PatientRef};
use shared_database::StoreError;
use shared_models::AppError;

// ==============================================================================
// RESERVATION MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    /// The slot is held. Stays `scheduled` even when external sync fails;
    /// the failure lives in `sync_log` instead.
    Scheduled,
    /// Set by operator tooling when a reservation is manually voided; the
    /// booking path only ever reads it and never writes it.
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LocationMode {
    Telehealth,
    InPerson,
}

impl fmt::Display for LocationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocationMode::Telehealth => write!(f, "telehealth"),
            LocationMode::InPerson => write!(f, "in_person"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub provider_id: Uuid,
    pub patient_id: Uuid,
    pub service_instance_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_minutes: i64,
    pub location_mode: LocationMode,
    pub status: ReservationStatus,
    /// Append-only diagnostic notes from the sync saga.
    pub sync_log: Option<String>,
    /// Counterpart appointment in the external EHR, once synced.
    pub ehr_appointment_id: Option<String>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: Uuid,
    pub display_name: String,
    pub active: bool,
}

/// One bookable offering row. `payer_id` null marks the global default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: Uuid,
    pub payer_id: Option<Uuid>,
    pub name: String,
    pub duration_minutes: Option<i64>,
    pub active: bool,
}

/// The single canonical offering resolved for a payer.
#[derive(Debug, Clone)]
pub struct ResolvedService {
    pub service_instance_id: Uuid,
    pub name: String,
    pub duration_minutes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub reservation_id: Uuid,
    pub response: Value,
    pub created_at: DateTime<Utc>,
}

// ==============================================================================
// REQUEST / RESPONSE MODELS
// ==============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct BookReservationRequest {
    pub patient: PatientRef,
    pub provider_id: Uuid,
    /// Raw payer identifier; validated by the service resolver.
    pub payer_id: String,
    pub start_time: DateTime<Utc>,
    pub location_mode: LocationMode,
    pub note: Option<String>,
    #[serde(default)]
    pub insurance: Option<InsuranceEnrichment>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Synced,
    Pending,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingResponse {
    pub reservation_id: Uuid,
    /// Null while external sync is pending or has failed.
    pub ehr_appointment_id: Option<String>,
    pub status: ReservationStatus,
    pub sync_state: SyncState,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_minutes: i64,
    pub provider_name: String,
    pub service_instance_id: Uuid,
    pub service_name: String,
}

// ==============================================================================
// ERROR TYPES
// ==============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum BookingError {
    #[error("Invalid booking request: {0}")]
    Validation(String),

    #[error("Patient not found")]
    PatientNotFound,

    #[error("Provider not found")]
    ProviderNotFound,

    #[error("Reservation not found")]
    ReservationNotFound,

    #[error("Invalid payer identifier: {0}")]
    InvalidPayerId(String),

    /// Configuration error: no active offering mapped for this payer.
    #[error("No bookable service configured for payer {0}")]
    NoServiceForPayer(Uuid),

    /// Configuration error: the offering exists but has no duration.
    #[error("Service instance {0} has no duration configured")]
    MissingDuration(Uuid),

    #[error("Slot already taken for provider {provider_id}")]
    SlotTaken {
        provider_id: Uuid,
        conflicting_reservation_id: Uuid,
    },

    /// External-system failure from the sync half of the saga, carrying how
    /// many attempts were spent before giving up.
    #[error("External system unavailable after {attempt} attempt(s): {cause}")]
    TransientExternal { attempt: u32, cause: String },

    #[error("Storage error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for BookingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => BookingError::ReservationNotFound,
            other => BookingError::Database(other.to_string()),
        }
    }
}

impl From<PatientError> for BookingError {
    fn from(err: PatientError) -> Self {
        match err {
            PatientError::NotFound => BookingError::PatientNotFound,
            PatientError::Validation(msg) => BookingError::Validation(msg),
            PatientError::Database(msg) => BookingError::Database(msg),
        }
    }
}

impl From<BookingError> for AppError {
    fn from(err: BookingError) -> Self {
        match &err {
            BookingError::Validation(_) | BookingError::InvalidPayerId(_) => {
                AppError::BadRequest(err.to_string())
            }
            BookingError::PatientNotFound
            | BookingError::ProviderNotFound
            | BookingError::ReservationNotFound => AppError::NotFound(err.to_string()),
            BookingError::SlotTaken { .. } => AppError::Conflict(err.to_string()),
            BookingError::NoServiceForPayer(_) | BookingError::MissingDuration(_) => {
                AppError::Unprocessable(err.to_string())
            }
            BookingError::TransientExternal { .. } => AppError::ExternalService(err.to_string()),
            BookingError::Database(_) => AppError::Database(err.to_string()),
            BookingError::Internal(_) => AppError::Internal(err.to_string()),
        }
    }
}
