// libs/ehr-cell/src/services/upsert.rs
//
// Find-or-create for the patient's counterpart record in the EHR. Only a
// strong composite match (name + date of birth) is trusted enough to update;
// a fallback match gets a brand-new record instead, because merging on weak
// evidence carries its own identity risk.

use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use patient_cell::models::Patient;
use patient_cell::services::identity::normalize_phone;
use patient_cell::services::patient::PatientService;
use shared_database::StoreClient;

use crate::models::{
    format_ehr_date, ClientSearchQuery, CreateEhrClientRequest, EhrClientId, EhrClientRecord,
    EhrError, InsuranceEnrichment, MatchTier, NewSyncAudit, SyncOperation, SyncOutcome,
};
use crate::services::alerts::{AlertSeverity, OperatorAlertService};
use crate::services::audit::SyncAuditService;
use crate::services::client::EhrApiClient;
use crate::services::verification::PropagationVerifier;

pub struct ClientUpsertService {
    api: Arc<EhrApiClient>,
    patients: PatientService,
    audit: SyncAuditService,
    alerts: Arc<OperatorAlertService>,
    verifier: PropagationVerifier,
}

impl ClientUpsertService {
    pub fn new(
        api: Arc<EhrApiClient>,
        store: Arc<StoreClient>,
        alerts: Arc<OperatorAlertService>,
        verifier: PropagationVerifier,
    ) -> Self {
        Self {
            api,
            patients: PatientService::new(Arc::clone(&store)),
            audit: SyncAuditService::new(store),
            alerts,
            verifier,
        }
    }

    /// Ensure the patient has exactly one EHR counterpart and return its
    /// validated reference. Never returns an empty reference: an empty or
    /// malformed id out of the EHR is a broken invariant and raised loudly.
    pub async fn ensure_client(
        &self,
        patient: &Patient,
        enrichment: &InsuranceEnrichment,
        reservation_id: Option<Uuid>,
    ) -> Result<(EhrClientId, Patient), EhrError> {
        // Already linked: reuse the stored reference after validating it.
        if let Some(existing) = &patient.ehr_client_id {
            let client_id = crate::models::normalize_client_id(&json!(existing))?;
            return Ok((client_id, patient.clone()));
        }

        let (sync_email, patient) = self.resolve_sync_email(patient).await?;

        let started = Instant::now();
        let query = ClientSearchQuery {
            email: None,
            last_name: Some(patient.last_name.clone()),
            date_of_birth: patient.date_of_birth.map(format_ehr_date),
        };
        let search_result = self.api.search_clients(&query).await;
        self.audit
            .record_operation(
                Some(patient.id),
                reservation_id,
                SyncOperation::SearchClients,
                search_result.as_ref().err().map(|e| e.to_string()),
                Some(json!({ "last_name": query.last_name, "date_of_birth": query.date_of_birth })),
                None,
                started.elapsed().as_millis() as i64,
            )
            .await;
        let candidates = search_result?;

        let classified = classify_candidates(&patient, enrichment, &candidates);

        let client_id = match classified {
            CandidateMatch::Strong(record) => {
                self.enrich_strong_match(&patient, enrichment, record, reservation_id)
                    .await?
            }
            CandidateMatch::Fallback(record) => {
                self.create_despite_fallback(&patient, enrichment, &sync_email, record, reservation_id)
                    .await?
            }
            CandidateMatch::None => {
                self.create_client(&patient, enrichment, &sync_email, MatchTier::NoMatch, reservation_id)
                    .await?
            }
        };

        if client_id.as_str().is_empty() {
            // normalize_client_id rejects empties, so reaching this means the
            // invariant machinery itself broke.
            return Err(EhrError::InvalidClientId(
                "EHR returned an empty client reference".to_string(),
            ));
        }

        let patient = self
            .patients
            .set_ehr_client_id(patient.id, client_id.as_str())
            .await
            .map_err(|e| EhrError::Storage(e.to_string()))?;

        Ok((client_id, patient))
    }

    /// Strong match: fill in missing fields via a partial update, then read
    /// back to confirm the date of birth applied (known to silently fail),
    /// retrying the write once if it did not stick.
    async fn enrich_strong_match(
        &self,
        patient: &Patient,
        enrichment: &InsuranceEnrichment,
        record: &EhrClientRecord,
        reservation_id: Option<Uuid>,
    ) -> Result<EhrClientId, EhrError> {
        let client_id = record.client_id()?;
        let patch = build_enrichment_patch(patient, enrichment, record);

        if patch.is_empty() {
            info!(
                "EHR client {} already complete for patient {}",
                client_id, patient.id
            );
            self.audit
                .record(NewSyncAudit {
                    patient_id: Some(patient.id),
                    reservation_id,
                    operation: SyncOperation::EnrichClient,
                    outcome: SyncOutcome::Skipped,
                    match_tier: Some(MatchTier::Strong),
                    request_payload: None,
                    response_payload: None,
                    error: None,
                    duration_ms: 0,
                })
                .await;
            return Ok(client_id);
        }

        let sent_dob = patch.contains_key("date_of_birth");
        let started = Instant::now();
        let update_result = self
            .api
            .update_client(&client_id, Value::Object(patch.clone()))
            .await;
        self.audit
            .record(NewSyncAudit {
                patient_id: Some(patient.id),
                reservation_id,
                operation: SyncOperation::EnrichClient,
                outcome: if update_result.is_ok() {
                    SyncOutcome::Success
                } else {
                    SyncOutcome::Failure
                },
                match_tier: Some(MatchTier::Strong),
                request_payload: Some(Value::Object(patch.clone())),
                response_payload: None,
                error: update_result.as_ref().err().map(|e| e.to_string()),
                duration_ms: started.elapsed().as_millis() as i64,
            })
            .await;
        update_result?;

        let readback = self.verifier.await_client_visible(&self.api, &client_id).await?;

        if sent_dob && readback.date_of_birth.is_none() {
            warn!(
                "EHR dropped date of birth for client {}, retrying update once",
                client_id
            );
            self.api
                .update_client(&client_id, Value::Object(patch))
                .await?;
            let second = self.api.get_client(&client_id).await?;
            if second.date_of_birth.is_none() {
                warn!(
                    "Date of birth still missing on EHR client {} after retry",
                    client_id
                );
            }
        }

        Ok(client_id)
    }

    /// Fallback match: deliberately not merged. Create a fresh record and
    /// tell an operator why a near-duplicate now exists.
    async fn create_despite_fallback(
        &self,
        patient: &Patient,
        enrichment: &InsuranceEnrichment,
        sync_email: &str,
        record: &EhrClientRecord,
        reservation_id: Option<Uuid>,
    ) -> Result<EhrClientId, EhrError> {
        let existing_ref = record
            .client_id()
            .map(|id| id.to_string())
            .unwrap_or_else(|_| "unparseable".to_string());

        self.audit
            .record(NewSyncAudit {
                patient_id: Some(patient.id),
                reservation_id,
                operation: SyncOperation::DuplicateDetected,
                outcome: SyncOutcome::Success,
                match_tier: Some(MatchTier::Fallback),
                request_payload: None,
                response_payload: Some(json!({ "existing_ehr_client": existing_ref })),
                error: None,
                duration_ms: 0,
            })
            .await;

        self.alerts
            .raise(
                AlertSeverity::Info,
                "ehr-sync",
                "Fallback identity match not merged",
                format!(
                    "Patient {} weakly matched EHR client {}; created a new record instead of merging",
                    patient.id, existing_ref
                ),
            )
            .await;

        self.create_client(patient, enrichment, sync_email, MatchTier::Fallback, reservation_id)
            .await
    }

    async fn create_client(
        &self,
        patient: &Patient,
        enrichment: &InsuranceEnrichment,
        sync_email: &str,
        tier: MatchTier,
        reservation_id: Option<Uuid>,
    ) -> Result<EhrClientId, EhrError> {
        let request = CreateEhrClientRequest {
            first_name: patient.first_name.clone(),
            last_name: patient.last_name.clone(),
            email: sync_email.to_string(),
            phone: patient.phone.clone(),
            date_of_birth: patient.date_of_birth.map(format_ehr_date),
            member_id: enrichment.member_id.clone(),
            group_number: enrichment.group_number.clone(),
            notes: enrichment.case_manager_note.clone(),
        };

        let started = Instant::now();
        let create_result = self.api.create_client(&request).await;
        self.audit
            .record(NewSyncAudit {
                patient_id: Some(patient.id),
                reservation_id,
                operation: SyncOperation::CreateClient,
                outcome: if create_result.is_ok() {
                    SyncOutcome::Success
                } else {
                    SyncOutcome::Failure
                },
                match_tier: Some(tier),
                request_payload: serde_json::to_value(&request).ok(),
                response_payload: create_result
                    .as_ref()
                    .ok()
                    .map(|id| json!({ "client_id": id.as_str() })),
                error: create_result.as_ref().err().map(|e| e.to_string()),
                duration_ms: started.elapsed().as_millis() as i64,
            })
            .await;
        let client_id = create_result?;

        let verify_started = Instant::now();
        let verify_result = self
            .verifier
            .await_client_visible(&self.api, &client_id)
            .await;
        self.audit
            .record_operation(
                Some(patient.id),
                reservation_id,
                SyncOperation::VerifyPropagation,
                verify_result.as_ref().err().map(|e| e.to_string()),
                Some(json!({ "client_id": client_id.as_str() })),
                None,
                verify_started.elapsed().as_millis() as i64,
            )
            .await;
        verify_result?;

        Ok(client_id)
    }

    /// Decide which email address to write to the EHR. When the canonical
    /// address already fronts a different local patient or a different EHR
    /// record, substitute a deterministic alias and persist it so every
    /// subsequent sync reuses the same mapping.
    async fn resolve_sync_email(&self, patient: &Patient) -> Result<(String, Patient), EhrError> {
        if let Some(alias) = &patient.ehr_email_alias {
            return Ok((alias.clone(), patient.clone()));
        }

        let mut collision = false;

        let locals = self
            .patients
            .find_by_email(&patient.email)
            .await
            .map_err(|e| EhrError::Storage(e.to_string()))?;
        if locals.iter().any(|p| p.id != patient.id) {
            collision = true;
        }

        if !collision {
            let query = ClientSearchQuery {
                email: Some(patient.email.clone()),
                last_name: None,
                date_of_birth: None,
            };
            let remote = self.api.search_clients(&query).await?;
            if remote.iter().any(|r| !plausibly_same_person(patient, r)) {
                collision = true;
            }
        }

        if !collision {
            return Ok((patient.email.clone(), patient.clone()));
        }

        let alias = derive_email_alias(&patient.email, patient.id);
        info!(
            "Email collision for patient {}; using alias {}",
            patient.id, alias
        );
        let updated = self
            .patients
            .set_email_alias(patient.id, &alias)
            .await
            .map_err(|e| EhrError::Storage(e.to_string()))?;
        Ok((alias, updated))
    }
}

// ==============================================================================
// PURE MATCHING & ALIAS HELPERS
// ==============================================================================

#[derive(Debug)]
enum CandidateMatch<'a> {
    Strong(&'a EhrClientRecord),
    Fallback(&'a EhrClientRecord),
    None,
}

/// Classify EHR search results against the local patient. Strong requires
/// name plus a compatible date of birth; fallback requires a matching date of
/// birth plus phone digits or insurance member id. The first strong hit wins
/// outright.
fn classify_candidates<'a>(
    patient: &Patient,
    enrichment: &InsuranceEnrichment,
    candidates: &'a [EhrClientRecord],
) -> CandidateMatch<'a> {
    if let Some(strong) = candidates.iter().find(|r| is_strong_ehr_match(patient, r)) {
        return CandidateMatch::Strong(strong);
    }
    if let Some(fallback) = candidates
        .iter()
        .find(|r| is_fallback_ehr_match(patient, enrichment, r))
    {
        return CandidateMatch::Fallback(fallback);
    }
    CandidateMatch::None
}

fn dob_matches(patient: &Patient, record: &EhrClientRecord) -> bool {
    match (patient.date_of_birth, &record.date_of_birth) {
        (Some(local), Some(remote)) => format_ehr_date(local) == remote.trim(),
        _ => false,
    }
}

/// The record's date of birth either equals the patient's or is absent. An
/// absent one does not contradict the match; enrichment fills it in.
fn dob_compatible(patient: &Patient, record: &EhrClientRecord) -> bool {
    record.date_of_birth.is_none() || dob_matches(patient, record)
}

fn name_matches(patient: &Patient, record: &EhrClientRecord) -> bool {
    let (Some(first), Some(last)) = (&record.first_name, &record.last_name) else {
        return false;
    };
    patient.first_name.trim().eq_ignore_ascii_case(first.trim())
        && patient.last_name.trim().eq_ignore_ascii_case(last.trim())
}

fn is_strong_ehr_match(patient: &Patient, record: &EhrClientRecord) -> bool {
    patient.date_of_birth.is_some()
        && name_matches(patient, record)
        && dob_compatible(patient, record)
}

fn is_fallback_ehr_match(
    patient: &Patient,
    enrichment: &InsuranceEnrichment,
    record: &EhrClientRecord,
) -> bool {
    if !dob_matches(patient, record) {
        return false;
    }

    let phone_hit = match (&patient.phone, &record.phone) {
        (Some(local), Some(remote)) => {
            let digits = normalize_phone(local);
            !digits.is_empty() && digits == normalize_phone(remote)
        }
        _ => false,
    };

    let member_hit = match (&enrichment.member_id, &record.member_id) {
        (Some(local), Some(remote)) => local.trim().eq_ignore_ascii_case(remote.trim()),
        _ => false,
    };

    phone_hit || member_hit
}

fn plausibly_same_person(patient: &Patient, record: &EhrClientRecord) -> bool {
    name_matches(patient, record)
}

/// Partial update for a strong match: only fields missing on the EHR side.
fn build_enrichment_patch(
    patient: &Patient,
    enrichment: &InsuranceEnrichment,
    record: &EhrClientRecord,
) -> Map<String, Value> {
    let mut patch = Map::new();

    if record.phone.is_none() {
        if let Some(phone) = &patient.phone {
            patch.insert("phone".to_string(), json!(phone));
        }
    }
    if record.date_of_birth.is_none() {
        if let Some(dob) = patient.date_of_birth {
            patch.insert("date_of_birth".to_string(), json!(format_ehr_date(dob)));
        }
    }
    if record.member_id.is_none() {
        if let Some(member_id) = &enrichment.member_id {
            patch.insert("member_id".to_string(), json!(member_id));
        }
    }
    if record.group_number.is_none() {
        if let Some(group) = &enrichment.group_number {
            patch.insert("group_number".to_string(), json!(group));
        }
    }
    if record.notes.is_none() {
        if let Some(note) = &enrichment.case_manager_note {
            patch.insert("notes".to_string(), json!(note));
        }
    }

    patch
}

/// Deterministic alias for a colliding email: the canonical local part plus a
/// short tag derived from the patient id. Same inputs, same alias, so the
/// mapping stays stable across syncs.
pub fn derive_email_alias(canonical: &str, patient_id: Uuid) -> String {
    let (local, domain) = canonical
        .split_once('@')
        .unwrap_or((canonical, "invalid.local"));
    let id_hex = patient_id.simple().to_string();
    format!("{}+{}@{}", local, &id_hex[..8], domain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use patient_cell::models::PatientStatus;

    fn patient() -> Patient {
        Patient {
            id: Uuid::new_v4(),
            first_name: "Jane".to_string(),
            last_name: "Doe".to_string(),
            email: "jane@x.com".to_string(),
            phone: Some("555-010-2233".to_string()),
            date_of_birth: NaiveDate::from_ymd_opt(1990, 1, 1),
            ehr_client_id: None,
            ehr_email_alias: None,
            status: PatientStatus::Active,
            referral_source: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn record(first: &str, last: &str, dob: Option<&str>) -> EhrClientRecord {
        EhrClientRecord {
            id: serde_json::json!(4182),
            first_name: Some(first.to_string()),
            last_name: Some(last.to_string()),
            email: None,
            phone: None,
            date_of_birth: dob.map(str::to_string),
            member_id: None,
            group_number: None,
            notes: None,
        }
    }

    #[test]
    fn strong_match_beats_fallback() {
        let p = patient();
        let enrichment = InsuranceEnrichment::default();

        let mut weak = record("J", "Doe", Some("1990-01-01"));
        weak.phone = Some("(555) 010 2233".to_string());
        let strong = record("jane", "doe", Some("1990-01-01"));

        let candidates = vec![weak, strong];
        assert!(matches!(
            classify_candidates(&p, &enrichment, &candidates),
            CandidateMatch::Strong(_)
        ));
    }

    #[test]
    fn fallback_by_phone_or_member_id() {
        let p = patient();
        let mut enrichment = InsuranceEnrichment::default();

        let mut by_phone = record("Janet", "D", Some("1990-01-01"));
        by_phone.phone = Some("+1 555 010 2233".to_string());
        assert!(matches!(
            classify_candidates(&p, &enrichment, std::slice::from_ref(&by_phone)),
            CandidateMatch::Fallback(_)
        ));

        enrichment.member_id = Some("MBR-77".to_string());
        let mut by_member = record("Janet", "D", Some("1990-01-01"));
        by_member.member_id = Some("mbr-77".to_string());
        assert!(matches!(
            classify_candidates(&p, &enrichment, std::slice::from_ref(&by_member)),
            CandidateMatch::Fallback(_)
        ));
    }

    #[test]
    fn name_match_with_absent_record_dob_is_strong() {
        // Records created before dob capture still strong-match on name; the
        // enrichment patch then fills the missing date of birth.
        let p = patient();
        let enrichment = InsuranceEnrichment::default();
        let candidate = record("Jane", "Doe", None);

        assert!(matches!(
            classify_candidates(&p, &enrichment, std::slice::from_ref(&candidate)),
            CandidateMatch::Strong(_)
        ));
    }

    #[test]
    fn contradictory_dob_is_never_strong() {
        let p = patient();
        let enrichment = InsuranceEnrichment::default();
        let candidate = record("Jane", "Doe", Some("1975-06-30"));

        assert!(matches!(
            classify_candidates(&p, &enrichment, std::slice::from_ref(&candidate)),
            CandidateMatch::None
        ));
    }

    #[test]
    fn no_dob_anywhere_is_no_match() {
        let mut p = patient();
        p.date_of_birth = None;
        let enrichment = InsuranceEnrichment::default();
        let mut candidate = record("Jane", "Doe", None);
        candidate.phone = Some("5550102233".to_string());

        assert!(matches!(
            classify_candidates(&p, &enrichment, std::slice::from_ref(&candidate)),
            CandidateMatch::None
        ));
    }

    #[test]
    fn enrichment_patch_only_fills_missing_fields() {
        let p = patient();
        let enrichment = InsuranceEnrichment {
            member_id: Some("MBR-1".to_string()),
            group_number: None,
            case_manager_note: Some("contact via case manager".to_string()),
        };

        let mut rec = record("Jane", "Doe", Some("1990-01-01"));
        rec.phone = Some("already there".to_string());

        let patch = build_enrichment_patch(&p, &enrichment, &rec);
        assert!(!patch.contains_key("phone"));
        assert!(!patch.contains_key("date_of_birth"));
        assert_eq!(patch.get("member_id"), Some(&serde_json::json!("MBR-1")));
        assert_eq!(
            patch.get("notes"),
            Some(&serde_json::json!("contact via case manager"))
        );
    }

    #[test]
    fn email_alias_is_deterministic() {
        let id = Uuid::parse_str("a1b2c3d4-0000-0000-0000-000000000000").unwrap();
        let alias = derive_email_alias("case.manager@agency.org", id);
        assert_eq!(alias, "case.manager+a1b2c3d4@agency.org");
        assert_eq!(alias, derive_email_alias("case.manager@agency.org", id));
    }
}
