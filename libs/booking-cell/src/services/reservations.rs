// libs/booking-cell/src/services/reservations.rs
//
// Row-store access for reservations. All writes are single-row and forward
// only: a reservation is never deleted, and sync progress lands either in
// `ehr_appointment_id` or as an appended `sync_log` note.

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use shared_database::StoreClient;

use crate::models::{
    BookingError, LocationMode, Reservation, ReservationStatus,
};

pub struct ReservationStore {
    store: Arc<StoreClient>,
}

pub struct NewReservation {
    pub provider_id: Uuid,
    pub patient_id: Uuid,
    pub service_instance_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_minutes: i64,
    pub location_mode: LocationMode,
    pub note: Option<String>,
}

impl ReservationStore {
    pub fn new(store: Arc<StoreClient>) -> Self {
        Self { store }
    }

    pub async fn get(&self, reservation_id: Uuid) -> Result<Reservation, BookingError> {
        let path = format!("/rest/v1/reservations?id=eq.{}", reservation_id);
        let rows: Vec<Reservation> = self.store.request(Method::GET, &path, None).await?;
        rows.into_iter()
            .next()
            .ok_or(BookingError::ReservationNotFound)
    }

    /// All of a provider's scheduled reservations whose interval could touch
    /// the given window. The coarse predicate narrows server-side; exact
    /// overlap is decided in code.
    pub async fn scheduled_overlapping(
        &self,
        provider_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Reservation>, BookingError> {
        let path = format!(
            "/rest/v1/reservations?provider_id=eq.{}&status=eq.scheduled&start_time=lt.{}&end_time=gt.{}&order=start_time.asc",
            provider_id,
            urlencoding::encode(&end.to_rfc3339()),
            urlencoding::encode(&start.to_rfc3339()),
        );
        let rows: Vec<Reservation> = self.store.request(Method::GET, &path, None).await?;
        Ok(rows)
    }

    pub async fn create(&self, new: NewReservation) -> Result<Reservation, BookingError> {
        let now = Utc::now();
        let body = json!({
            "id": Uuid::new_v4(),
            "provider_id": new.provider_id,
            "patient_id": new.patient_id,
            "service_instance_id": new.service_instance_id,
            "start_time": new.start_time.to_rfc3339(),
            "end_time": new.end_time.to_rfc3339(),
            "duration_minutes": new.duration_minutes,
            "location_mode": new.location_mode,
            "status": ReservationStatus::Scheduled,
            "note": new.note,
            "created_at": now.to_rfc3339(),
            "updated_at": now.to_rfc3339(),
        });

        let reservation: Reservation = self
            .store
            .insert_returning("/rest/v1/reservations", body)
            .await?;
        debug!(
            "Reservation {} written for provider {} at {}",
            reservation.id, reservation.provider_id, reservation.start_time
        );
        Ok(reservation)
    }

    pub async fn set_ehr_appointment_id(
        &self,
        reservation_id: Uuid,
        ehr_appointment_id: &str,
    ) -> Result<Reservation, BookingError> {
        let path = format!("/rest/v1/reservations?id=eq.{}", reservation_id);
        let body = json!({
            "ehr_appointment_id": ehr_appointment_id,
            "updated_at": Utc::now().to_rfc3339(),
        });
        Ok(self.store.update_returning(&path, body).await?)
    }

    /// Append one timestamped line to the reservation's diagnostic log. The
    /// log is append-only; existing content is never rewritten.
    pub async fn append_sync_note(
        &self,
        reservation: &Reservation,
        note: &str,
    ) -> Result<Reservation, BookingError> {
        let line = format!("[{}] {}", Utc::now().to_rfc3339(), note);
        let combined = match &reservation.sync_log {
            Some(existing) => format!("{}\n{}", existing, line),
            None => line,
        };

        let path = format!("/rest/v1/reservations?id=eq.{}", reservation.id);
        let body = json!({
            "sync_log": combined,
            "updated_at": Utc::now().to_rfc3339(),
        });
        Ok(self.store.update_returning(&path, body).await?)
    }
}
