// libs/patient-cell/src/services/identity.rs
//
// Tiered patient identity resolution. Matching deliberately requires the
// full composite identity before reusing a row: a shared email alone (a case
// manager booking for several clients) must never merge two distinct people.

use std::sync::Arc;
use tracing::{debug, info};

use shared_database::StoreClient;

use crate::models::{
    MatchConfidence, Patient, PatientDescriptor, PatientError, PatientRef, ReferralAttribution,
};
use crate::services::patient::PatientService;

pub struct IdentityResolutionService {
    patients: PatientService,
}

impl IdentityResolutionService {
    pub fn new(store: Arc<StoreClient>) -> Self {
        Self {
            patients: PatientService::new(store),
        }
    }

    /// Resolve a booking request's patient reference to a concrete row.
    ///
    /// An explicit id must exist or the operation fails. A descriptor is
    /// matched tier by tier, stopping at the first hit; when nothing matches
    /// a new patient is created and the referral attribution (if any) is
    /// stored with it.
    pub async fn resolve(
        &self,
        patient_ref: &PatientRef,
    ) -> Result<(Patient, MatchConfidence), PatientError> {
        match patient_ref {
            PatientRef::Existing { patient_id } => {
                let patient = self.patients.get_patient(*patient_id).await?;
                Ok((patient, MatchConfidence::ById))
            }
            PatientRef::New {
                descriptor,
                referral,
            } => self.resolve_descriptor(descriptor, referral.as_ref()).await,
        }
    }

    async fn resolve_descriptor(
        &self,
        descriptor: &PatientDescriptor,
        referral: Option<&ReferralAttribution>,
    ) -> Result<(Patient, MatchConfidence), PatientError> {
        validate_descriptor(descriptor)?;

        let candidates = self.patients.find_by_email(&descriptor.email).await?;
        debug!(
            "Identity resolution: {} candidate(s) share email {}",
            candidates.len(),
            normalize_email(&descriptor.email)
        );

        if let Some(existing) = candidates.iter().find(|p| is_strong_match(descriptor, p)) {
            info!("Strong identity match for patient {}", existing.id);
            let enriched = self.patients.fill_missing_fields(existing, descriptor).await?;
            return Ok((enriched, MatchConfidence::Strong));
        }

        // Phone-based fallback applies only when the request carries no date
        // of birth; with a dob present, a dob mismatch means a different person.
        if descriptor.date_of_birth.is_none() {
            if let Some(existing) = candidates.iter().find(|p| is_fallback_match(descriptor, p)) {
                info!("Fallback identity match for patient {}", existing.id);
                let enriched = self.patients.fill_missing_fields(existing, descriptor).await?;
                return Ok((enriched, MatchConfidence::Fallback));
            }
        }

        let created = self.patients.create_patient(descriptor, referral).await?;
        info!("Created new patient {} for {}", created.id, created.email);
        Ok((created, MatchConfidence::Created))
    }
}

fn validate_descriptor(descriptor: &PatientDescriptor) -> Result<(), PatientError> {
    if descriptor.first_name.trim().is_empty() || descriptor.last_name.trim().is_empty() {
        return Err(PatientError::Validation(
            "first and last name are required".to_string(),
        ));
    }
    let email = normalize_email(&descriptor.email);
    if email.is_empty() || !email.contains('@') {
        return Err(PatientError::Validation(
            "a valid email address is required".to_string(),
        ));
    }
    Ok(())
}

// ==============================================================================
// NORMALIZATION & MATCH TIERS
// ==============================================================================

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Digits only; all formatting and punctuation stripped.
pub fn normalize_phone(phone: &str) -> String {
    phone.chars().filter(|c| c.is_ascii_digit()).collect()
}

fn names_match(descriptor: &PatientDescriptor, patient: &Patient) -> bool {
    descriptor.first_name.trim().eq_ignore_ascii_case(patient.first_name.trim())
        && descriptor.last_name.trim().eq_ignore_ascii_case(patient.last_name.trim())
}

fn emails_match(descriptor: &PatientDescriptor, patient: &Patient) -> bool {
    normalize_email(&descriptor.email) == normalize_email(&patient.email)
}

/// Strong tier: email, first name, last name and date of birth all equal.
pub fn is_strong_match(descriptor: &PatientDescriptor, patient: &Patient) -> bool {
    let (Some(desc_dob), Some(row_dob)) = (descriptor.date_of_birth, patient.date_of_birth) else {
        return false;
    };
    emails_match(descriptor, patient) && names_match(descriptor, patient) && desc_dob == row_dob
}

/// Fallback tier: email + name + phone digits, used only when the incoming
/// description carries no date of birth.
pub fn is_fallback_match(descriptor: &PatientDescriptor, patient: &Patient) -> bool {
    let (Some(desc_phone), Some(row_phone)) = (&descriptor.phone, &patient.phone) else {
        return false;
    };
    let desc_digits = normalize_phone(desc_phone);
    if desc_digits.is_empty() {
        return false;
    }
    emails_match(descriptor, patient)
        && names_match(descriptor, patient)
        && desc_digits == normalize_phone(row_phone)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PatientStatus;
    use chrono::{NaiveDate, Utc};
    use uuid::Uuid;

    fn patient(email: &str, first: &str, last: &str, dob: Option<&str>, phone: Option<&str>) -> Patient {
        Patient {
            id: Uuid::new_v4(),
            first_name: first.to_string(),
            last_name: last.to_string(),
            email: email.to_string(),
            phone: phone.map(str::to_string),
            date_of_birth: dob.map(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").unwrap()),
            ehr_client_id: None,
            ehr_email_alias: None,
            status: PatientStatus::Active,
            referral_source: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn descriptor(email: &str, first: &str, last: &str, dob: Option<&str>, phone: Option<&str>) -> PatientDescriptor {
        PatientDescriptor {
            first_name: first.to_string(),
            last_name: last.to_string(),
            email: email.to_string(),
            phone: phone.map(str::to_string),
            date_of_birth: dob.map(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").unwrap()),
        }
    }

    #[test]
    fn normalizes_email_case_and_whitespace() {
        assert_eq!(normalize_email("  Jane.Doe@X.COM "), "jane.doe@x.com");
    }

    #[test]
    fn normalizes_phone_to_digits() {
        assert_eq!(normalize_phone("+1 (555) 010-2233"), "15550102233");
        assert_eq!(normalize_phone("555.010.2233"), "5550102233");
    }

    #[test]
    fn strong_match_requires_all_four_fields() {
        let row = patient("a@x.com", "Jane", "Doe", Some("1990-01-01"), None);

        let exact = descriptor("A@x.com ", "jane", "DOE", Some("1990-01-01"), None);
        assert!(is_strong_match(&exact, &row));

        let wrong_dob = descriptor("a@x.com", "Jane", "Doe", Some("1991-01-01"), None);
        assert!(!is_strong_match(&wrong_dob, &row));

        let wrong_name = descriptor("a@x.com", "John", "Doe", Some("1990-01-01"), None);
        assert!(!is_strong_match(&wrong_name, &row));

        let no_dob = descriptor("a@x.com", "Jane", "Doe", None, None);
        assert!(!is_strong_match(&no_dob, &row));
    }

    #[test]
    fn fallback_match_uses_phone_digits() {
        let row = patient("a@x.com", "Jane", "Doe", None, Some("(555) 010-2233"));

        let hit = descriptor("a@x.com", "Jane", "Doe", None, Some("555-010-2233"));
        assert!(is_fallback_match(&hit, &row));

        let wrong_phone = descriptor("a@x.com", "Jane", "Doe", None, Some("555-999-0000"));
        assert!(!is_fallback_match(&wrong_phone, &row));

        let no_phone = descriptor("a@x.com", "Jane", "Doe", None, None);
        assert!(!is_fallback_match(&no_phone, &row));
    }

    #[test]
    fn shared_email_alone_is_not_a_match() {
        // A case manager's address can front several distinct patients.
        let row = patient("cm@agency.org", "Jane", "Doe", Some("1990-01-01"), None);
        let other = descriptor("cm@agency.org", "Mark", "Smith", Some("1984-06-12"), None);

        assert!(!is_strong_match(&other, &row));
        assert!(!is_fallback_match(&other, &row));
    }
}
