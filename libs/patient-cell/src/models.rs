// libs/patient-cell/src/models.rs
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patient {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    /// Counterpart record in the external EHR, once synced.
    pub ehr_client_id: Option<String>,
    /// Substitute address used in the EHR when the canonical email collides
    /// with a different patient. Stable once assigned.
    pub ehr_email_alias: Option<String>,
    pub status: PatientStatus,
    pub referral_source: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PatientStatus {
    Active,
    Inactive,
}

impl fmt::Display for PatientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatientStatus::Active => write!(f, "active"),
            PatientStatus::Inactive => write!(f, "inactive"),
        }
    }
}

/// Incoming description of a patient who may or may not already exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientDescriptor {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
}

/// Optional attribution captured only when a brand-new patient row is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferralAttribution {
    pub source: String,
}

/// How a booking request identifies its patient.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PatientRef {
    Existing { patient_id: Uuid },
    New {
        #[serde(flatten)]
        descriptor: PatientDescriptor,
        referral: Option<ReferralAttribution>,
    },
}

/// Which matching tier produced the resolved patient.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchConfidence {
    /// Looked up directly by id.
    ById,
    /// Email + first name + last name + date of birth all matched.
    Strong,
    /// Email + name + phone matched; date of birth was absent.
    Fallback,
    /// No tier matched; a new patient row was created.
    Created,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PatientError {
    #[error("Patient not found")]
    NotFound,

    #[error("Invalid patient data: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(String),
}
