use chrono::Utc;
use reqwest::Method;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use shared_database::{StoreClient, StoreError};

use crate::models::{Patient, PatientDescriptor, PatientError, ReferralAttribution};
use crate::services::identity::normalize_email;

pub struct PatientService {
    store: Arc<StoreClient>,
}

impl PatientService {
    pub fn new(store: Arc<StoreClient>) -> Self {
        Self { store }
    }

    pub async fn get_patient(&self, patient_id: Uuid) -> Result<Patient, PatientError> {
        debug!("Fetching patient: {}", patient_id);

        let path = format!("/rest/v1/patients?id=eq.{}", patient_id);
        let result: Vec<Value> = self
            .store
            .request(Method::GET, &path, None)
            .await
            .map_err(|e| PatientError::Database(e.to_string()))?;

        if result.is_empty() {
            return Err(PatientError::NotFound);
        }

        serde_json::from_value(result[0].clone())
            .map_err(|e| PatientError::Database(format!("Failed to parse patient: {}", e)))
    }

    /// All patients whose normalized email equals the given one. Several
    /// distinct patients may legitimately share an address (a case manager's),
    /// so this returns every candidate for the caller to disambiguate.
    pub async fn find_by_email(&self, email: &str) -> Result<Vec<Patient>, PatientError> {
        let normalized = normalize_email(email);
        let path = format!(
            "/rest/v1/patients?email=eq.{}&order=created_at.asc",
            urlencoding::encode(&normalized)
        );

        let result: Vec<Value> = self
            .store
            .request(Method::GET, &path, None)
            .await
            .map_err(|e| PatientError::Database(e.to_string()))?;

        result
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<Patient>, _>>()
            .map_err(|e| PatientError::Database(format!("Failed to parse patients: {}", e)))
    }

    pub async fn create_patient(
        &self,
        descriptor: &PatientDescriptor,
        referral: Option<&ReferralAttribution>,
    ) -> Result<Patient, PatientError> {
        debug!("Creating new patient for {}", descriptor.email);

        let now = Utc::now();
        let patient_data = json!({
            "first_name": descriptor.first_name.trim(),
            "last_name": descriptor.last_name.trim(),
            "email": normalize_email(&descriptor.email),
            "phone": descriptor.phone,
            "date_of_birth": descriptor.date_of_birth.map(|d| d.format("%Y-%m-%d").to_string()),
            "status": "active",
            "referral_source": referral.map(|r| r.source.clone()),
            "created_at": now.to_rfc3339(),
            "updated_at": now.to_rfc3339()
        });

        self.store
            .insert_returning("/rest/v1/patients", patient_data)
            .await
            .map_err(|e| PatientError::Database(e.to_string()))
    }

    /// Record the patient's EHR counterpart reference.
    pub async fn set_ehr_client_id(
        &self,
        patient_id: Uuid,
        ehr_client_id: &str,
    ) -> Result<Patient, PatientError> {
        self.patch_patient(
            patient_id,
            json!({ "ehr_client_id": ehr_client_id, "updated_at": Utc::now().to_rfc3339() }),
        )
        .await
    }

    /// Persist the email alias so subsequent syncs reuse the same address.
    pub async fn set_email_alias(
        &self,
        patient_id: Uuid,
        alias: &str,
    ) -> Result<Patient, PatientError> {
        self.patch_patient(
            patient_id,
            json!({ "ehr_email_alias": alias, "updated_at": Utc::now().to_rfc3339() }),
        )
        .await
    }

    /// Fill in identity fields that were absent when the row was created.
    /// Only missing fields are written; existing values are never overwritten.
    pub async fn fill_missing_fields(
        &self,
        patient: &Patient,
        descriptor: &PatientDescriptor,
    ) -> Result<Patient, PatientError> {
        let mut update = Map::new();

        if patient.phone.is_none() {
            if let Some(phone) = &descriptor.phone {
                update.insert("phone".to_string(), json!(phone));
            }
        }
        if patient.date_of_birth.is_none() {
            if let Some(dob) = descriptor.date_of_birth {
                update.insert(
                    "date_of_birth".to_string(),
                    json!(dob.format("%Y-%m-%d").to_string()),
                );
            }
        }

        if update.is_empty() {
            return Ok(patient.clone());
        }

        update.insert("updated_at".to_string(), json!(Utc::now().to_rfc3339()));
        self.patch_patient(patient.id, Value::Object(update)).await
    }

    async fn patch_patient(&self, patient_id: Uuid, body: Value) -> Result<Patient, PatientError> {
        let path = format!("/rest/v1/patients?id=eq.{}", patient_id);
        self.store
            .update_returning(&path, body)
            .await
            .map_err(|e| match e {
                StoreError::NotFound(_) => PatientError::NotFound,
                other => PatientError::Database(other.to_string()),
            })
    }
}
