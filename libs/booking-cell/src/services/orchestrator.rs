// libs/booking-cell/src/services/orchestrator.rs
//
// The booking saga: identity, service, idempotency, slot, local reservation,
// then external sync. Compensation is forward-only. Once the local
// reservation row is written the slot is genuinely held, so every later
// failure is recorded and alerted instead of rolled back.

use chrono::Duration as ChronoDuration;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use ehr_cell::models::{
    CreateEhrAppointmentRequest, EhrClientId, InsuranceEnrichment, NewSyncAudit, SyncOperation,
    SyncOutcome,
};
use ehr_cell::services::alerts::{AlertSeverity, OperatorAlertService};
use ehr_cell::services::audit::SyncAuditService;
use ehr_cell::services::cache::AppointmentReadCache;
use ehr_cell::services::client::EhrApiClient;
use ehr_cell::services::retry::{retry_with_backoff, BackoffPolicy, Sleep};
use ehr_cell::services::upsert::ClientUpsertService;
use ehr_cell::services::verification::PropagationVerifier;
use patient_cell::models::Patient;
use patient_cell::services::identity::IdentityResolutionService;
use reqwest::Method;
use shared_config::AppConfig;
use shared_database::StoreClient;

use crate::models::{
    BookReservationRequest, BookingError, BookingResponse, Provider, Reservation, ResolvedService,
    SyncState,
};
use crate::services::conflict::{intervals_overlap, SlotCheck, SlotConflictService};
use crate::services::idempotency::IdempotencyService;
use crate::services::reservations::{NewReservation, ReservationStore};
use crate::services::service_resolver::ServiceResolver;

pub struct BookingOrchestrator {
    store: Arc<StoreClient>,
    identity: IdentityResolutionService,
    services: ServiceResolver,
    conflicts: SlotConflictService,
    idempotency: IdempotencyService,
    reservations: ReservationStore,
    ehr: Arc<EhrApiClient>,
    upserter: ClientUpsertService,
    cache: Arc<AppointmentReadCache>,
    audit: SyncAuditService,
    alerts: Arc<OperatorAlertService>,
    policy: BackoffPolicy,
    sleep: Arc<dyn Sleep>,
}

impl BookingOrchestrator {
    pub fn new(
        config: &AppConfig,
        store: Arc<StoreClient>,
        ehr: Arc<EhrApiClient>,
        cache: Arc<AppointmentReadCache>,
        alerts: Arc<OperatorAlertService>,
        sleep: Arc<dyn Sleep>,
    ) -> Self {
        let verifier = PropagationVerifier::from_config(config, Arc::clone(&sleep));
        let upserter = ClientUpsertService::new(
            Arc::clone(&ehr),
            Arc::clone(&store),
            Arc::clone(&alerts),
            verifier,
        );

        Self {
            identity: IdentityResolutionService::new(Arc::clone(&store)),
            services: ServiceResolver::new(Arc::clone(&store)),
            conflicts: SlotConflictService::new(Arc::clone(&store)),
            idempotency: IdempotencyService::new(Arc::clone(&store)),
            reservations: ReservationStore::new(Arc::clone(&store)),
            audit: SyncAuditService::new(Arc::clone(&store)),
            store,
            ehr,
            upserter,
            cache,
            alerts,
            policy: BackoffPolicy::from_config(config),
            sleep,
        }
    }

    pub async fn book(
        &self,
        request: BookReservationRequest,
        idempotency_key: Option<String>,
    ) -> Result<BookingResponse, BookingError> {
        // Replay short-circuit: a known key answers with the stored response
        // and executes nothing.
        if let Some(key) = &idempotency_key {
            if let Some(record) = self.idempotency.find(key).await? {
                info!("Idempotent replay for key {}", key);
                return decode_stored_response(record.response);
            }
        }

        let (patient, confidence) = self.identity.resolve(&request.patient).await?;
        info!(
            "Patient resolved: {} (confidence {:?})",
            patient.id, confidence
        );

        let service = self.services.resolve(&request.payer_id).await?;
        let provider = self.get_provider(request.provider_id).await?;

        let start = request.start_time;
        let end = start + ChronoDuration::minutes(service.duration_minutes);

        match self
            .conflicts
            .check_slot(provider.id, patient.id, start, end)
            .await?
        {
            SlotCheck::Free => {}
            SlotCheck::DuplicateSubmission(existing) => {
                // Answer with the reservation already held, described by that
                // row's own service rather than the one just resolved.
                let booked_service = if existing.service_instance_id == service.service_instance_id
                {
                    service
                } else {
                    self.services.describe(existing.service_instance_id).await?
                };
                let response = build_response(&existing, &provider, &booked_service);
                return self
                    .finish(response, existing.id, idempotency_key.as_deref())
                    .await;
            }
            SlotCheck::Taken {
                conflicting_reservation_id,
            } => {
                return Err(BookingError::SlotTaken {
                    provider_id: provider.id,
                    conflicting_reservation_id,
                });
            }
        }

        let reservation = self
            .reservations
            .create(NewReservation {
                provider_id: provider.id,
                patient_id: patient.id,
                service_instance_id: service.service_instance_id,
                start_time: start,
                end_time: end,
                duration_minutes: service.duration_minutes,
                location_mode: request.location_mode,
                note: request.note.clone(),
            })
            .await?;

        // The slot is held from here on. External failures degrade, never
        // abort.
        let enrichment = request.insurance.clone().unwrap_or_default();
        let reservation = match self
            .sync_external(&reservation, &patient, &enrichment, &provider, &service, &request)
            .await
        {
            Ok(updated) => updated,
            Err(cause) => self.degrade(reservation, &patient, cause).await,
        };

        let response = build_response(&reservation, &provider, &service);
        self.finish(response, reservation.id, idempotency_key.as_deref())
            .await
    }

    pub async fn get_reservation(&self, reservation_id: Uuid) -> Result<Reservation, BookingError> {
        self.reservations.get(reservation_id).await
    }

    pub async fn check_availability(
        &self,
        provider_id: Uuid,
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
    ) -> Result<Option<Uuid>, BookingError> {
        self.conflicts.first_conflict(provider_id, start, end).await
    }

    async fn get_provider(&self, provider_id: Uuid) -> Result<Provider, BookingError> {
        let path = format!("/rest/v1/providers?id=eq.{}", provider_id);
        let rows: Vec<Provider> = self.store.request(Method::GET, &path, None).await?;
        rows.into_iter()
            .next()
            .filter(|p| p.active)
            .ok_or(BookingError::ProviderNotFound)
    }

    /// The external half of the saga: client upsert, advisory cross-check,
    /// appointment creation with bounded retry, then swallowed secondary
    /// side effects. External failures come back as `TransientExternal`
    /// carrying the attempts spent, for the diagnostic log and the alert.
    async fn sync_external(
        &self,
        reservation: &Reservation,
        patient: &Patient,
        enrichment: &InsuranceEnrichment,
        provider: &Provider,
        service: &ResolvedService,
        request: &BookReservationRequest,
    ) -> Result<Reservation, BookingError> {
        let (client_id, _patient) = self
            .upserter
            .ensure_client(patient, enrichment, Some(reservation.id))
            .await
            .map_err(|e| BookingError::TransientExternal {
                attempt: 1,
                cause: format!("client upsert failed: {}", e),
            })?;

        self.cross_check_external_calendar(reservation, provider)
            .await;

        let appointment_request = CreateEhrAppointmentRequest {
            client_id: client_id.as_str().to_string(),
            provider_ref: provider.id.to_string(),
            start_time: reservation.start_time,
            end_time: reservation.end_time,
            service_name: service.name.clone(),
            location_mode: request.location_mode.to_string(),
            note: request.note.clone(),
        };

        let started = Instant::now();
        let attempts = AtomicU32::new(0);
        let result = retry_with_backoff(
            &self.policy,
            self.sleep.as_ref(),
            "create_ehr_appointment",
            |attempt| {
                attempts.store(attempt, Ordering::Relaxed);
                let ehr = Arc::clone(&self.ehr);
                let req = appointment_request.clone();
                async move { ehr.create_appointment(&req).await }
            },
        )
        .await;

        self.audit
            .record(NewSyncAudit {
                patient_id: Some(patient.id),
                reservation_id: Some(reservation.id),
                operation: SyncOperation::CreateAppointment,
                outcome: if result.is_ok() {
                    SyncOutcome::Success
                } else {
                    SyncOutcome::Failure
                },
                match_tier: None,
                request_payload: serde_json::to_value(&appointment_request).ok(),
                response_payload: result.as_ref().ok().map(|id| serde_json::json!({ "id": id })),
                error: result.as_ref().err().map(|e| e.to_string()),
                duration_ms: started.elapsed().as_millis() as i64,
            })
            .await;

        let appointment_id = result.map_err(|e| BookingError::TransientExternal {
            attempt: attempts.load(Ordering::Relaxed).max(1),
            cause: format!("appointment creation failed: {}", e),
        })?;

        self.cache
            .invalidate(provider.id, reservation.start_time.date_naive())
            .await;

        let updated = self
            .reservations
            .set_ehr_appointment_id(reservation.id, &appointment_id)
            .await
            .map_err(|e| {
                BookingError::Database(format!(
                    "EHR appointment {} created but local link failed: {}",
                    appointment_id, e
                ))
            })?;

        self.run_secondary_side_effects(&updated, patient, &client_id)
            .await;

        Ok(updated)
    }

    /// Advisory only: a mismatch between the local calendar and the EHR's is
    /// worth a warning, never a failure. Served through the read cache, stale
    /// on error.
    async fn cross_check_external_calendar(&self, reservation: &Reservation, provider: &Provider) {
        let date = reservation.start_time.date_naive();
        let ehr = Arc::clone(&self.ehr);
        let provider_id = provider.id;

        match self
            .cache
            .get_or_fetch(provider_id, date, || async move {
                ehr.list_appointments(provider_id, date).await
            })
            .await
        {
            Ok(appointments) => {
                let clash = appointments.iter().any(|a| {
                    intervals_overlap(
                        a.start_time,
                        a.end_time,
                        reservation.start_time,
                        reservation.end_time,
                    )
                });
                if clash {
                    warn!(
                        "EHR calendar already shows an appointment overlapping reservation {} for provider {}",
                        reservation.id, provider_id
                    );
                }
            }
            Err(e) => {
                warn!(
                    "Skipping EHR calendar cross-check for provider {}: {}",
                    provider_id, e
                );
            }
        }
    }

    /// Questionnaire and confirmation are nice-to-have. Each is wrapped so
    /// its failure is logged and alerted but never fails the booking.
    async fn run_secondary_side_effects(
        &self,
        reservation: &Reservation,
        patient: &Patient,
        client_id: &EhrClientId,
    ) {
        let started = Instant::now();
        let result = self.ehr.send_questionnaire(client_id, "intake").await;
        if let Err(e) = &result {
            warn!(
                "Intake questionnaire for reservation {} failed: {}",
                reservation.id, e
            );
            self.alerts
                .raise(
                    AlertSeverity::Warning,
                    "booking-sync",
                    "Intake questionnaire delivery failed",
                    format!(
                        "Reservation {}, EHR client {}: {}",
                        reservation.id, client_id, e
                    ),
                )
                .await;
        }
        self.audit
            .record_operation(
                Some(patient.id),
                Some(reservation.id),
                SyncOperation::SendQuestionnaire,
                result.err().map(|e| e.to_string()),
                None,
                None,
                started.elapsed().as_millis() as i64,
            )
            .await;

        info!(
            "Booking confirmation queued for patient {} (reservation {})",
            patient.id, reservation.id
        );
    }

    /// Forward-only compensation: keep the reservation, write the failure to
    /// its diagnostic log, and hand operators what they need to finish the
    /// sync manually.
    async fn degrade(
        &self,
        reservation: Reservation,
        patient: &Patient,
        cause: BookingError,
    ) -> Reservation {
        warn!(
            "External sync failed for reservation {}: {}",
            reservation.id, cause
        );

        self.alerts
            .raise(
                AlertSeverity::Critical,
                "booking-sync",
                "Reservation booked locally but EHR sync failed",
                format!(
                    "Reservation {} (patient {}, provider {}, start {}): {}. Complete the EHR sync manually.",
                    reservation.id,
                    patient.id,
                    reservation.provider_id,
                    reservation.start_time,
                    cause
                ),
            )
            .await;

        match self
            .reservations
            .append_sync_note(&reservation, &format!("external sync failed: {}", cause))
            .await
        {
            Ok(updated) => updated,
            Err(e) => {
                warn!(
                    "Could not append sync note to reservation {}: {}",
                    reservation.id, e
                );
                reservation
            }
        }
    }

    /// Persist the idempotency record when a key was supplied. Losing the
    /// insert race swaps in the winner's stored response so concurrent
    /// duplicates observe one booking.
    async fn finish(
        &self,
        response: BookingResponse,
        reservation_id: Uuid,
        idempotency_key: Option<&str>,
    ) -> Result<BookingResponse, BookingError> {
        let Some(key) = idempotency_key else {
            return Ok(response);
        };

        let encoded = serde_json::to_value(&response)
            .map_err(|e| BookingError::Internal(format!("response encoding failed: {}", e)))?;

        match self.idempotency.persist(key, reservation_id, &encoded).await {
            Some(winner) => decode_stored_response(winner),
            None => Ok(response),
        }
    }
}

fn build_response(
    reservation: &Reservation,
    provider: &Provider,
    service: &ResolvedService,
) -> BookingResponse {
    BookingResponse {
        reservation_id: reservation.id,
        ehr_appointment_id: reservation.ehr_appointment_id.clone(),
        status: reservation.status.clone(),
        sync_state: if reservation.ehr_appointment_id.is_some() {
            SyncState::Synced
        } else {
            SyncState::Pending
        },
        start_time: reservation.start_time,
        end_time: reservation.end_time,
        duration_minutes: reservation.duration_minutes,
        provider_name: provider.display_name.clone(),
        service_instance_id: service.service_instance_id,
        service_name: service.name.clone(),
    }
}

fn decode_stored_response(value: Value) -> Result<BookingResponse, BookingError> {
    serde_json::from_value(value)
        .map_err(|e| BookingError::Internal(format!("stored response unreadable: {}", e)))
}
