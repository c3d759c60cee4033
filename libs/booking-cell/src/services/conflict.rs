// libs/booking-cell/src/services/conflict.rs
//
// Half-open interval overlap against all of a provider's scheduled
// reservations, plus the duplicate-submission carve-out: a conflicting row
// for the same patient written within the last thirty seconds is a client
// retry, not a real conflict.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use shared_database::StoreClient;

use crate::models::{BookingError, Reservation};
use crate::services::reservations::ReservationStore;

/// How recently a conflicting same-patient row must have been created to be
/// treated as a retried submission. A heuristic: two genuinely distinct
/// bookings by the same patient inside this window would be misread as one.
pub const DUPLICATE_SUBMISSION_WINDOW_SECS: i64 = 30;

#[derive(Debug)]
pub enum SlotCheck {
    Free,
    /// A retried submission of the same booking; the caller should answer
    /// with this existing reservation.
    DuplicateSubmission(Reservation),
    Taken { conflicting_reservation_id: Uuid },
}

pub struct SlotConflictService {
    reservations: ReservationStore,
}

impl SlotConflictService {
    pub fn new(store: Arc<StoreClient>) -> Self {
        Self {
            reservations: ReservationStore::new(store),
        }
    }

    pub async fn check_slot(
        &self,
        provider_id: Uuid,
        patient_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<SlotCheck, BookingError> {
        let existing = self
            .reservations
            .scheduled_overlapping(provider_id, start, end)
            .await?;

        let conflicts: Vec<&Reservation> = existing
            .iter()
            .filter(|r| intervals_overlap(r.start_time, r.end_time, start, end))
            .collect();

        if conflicts.is_empty() {
            return Ok(SlotCheck::Free);
        }

        let now = Utc::now();
        if let Some(duplicate) = find_duplicate_submission(patient_id, now, &conflicts) {
            info!(
                "Treating booking as retried submission of reservation {}",
                duplicate.id
            );
            return Ok(SlotCheck::DuplicateSubmission((*duplicate).clone()));
        }

        debug!(
            "Slot conflict for provider {}: {} overlapping reservation(s)",
            provider_id,
            conflicts.len()
        );
        Ok(SlotCheck::Taken {
            conflicting_reservation_id: conflicts[0].id,
        })
    }

    /// Advisory availability check; no duplicate-submission carve-out since
    /// there is no submitting patient.
    pub async fn first_conflict(
        &self,
        provider_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<Uuid>, BookingError> {
        let existing = self
            .reservations
            .scheduled_overlapping(provider_id, start, end)
            .await?;
        Ok(existing
            .iter()
            .find(|r| intervals_overlap(r.start_time, r.end_time, start, end))
            .map(|r| r.id))
    }
}

/// Half-open overlap: [a_start, a_end) and [b_start, b_end) conflict iff each
/// starts before the other ends. Touching at a boundary is not a conflict.
pub fn intervals_overlap(
    a_start: DateTime<Utc>,
    a_end: DateTime<Utc>,
    b_start: DateTime<Utc>,
    b_end: DateTime<Utc>,
) -> bool {
    a_start < b_end && a_end > b_start
}

fn find_duplicate_submission<'a>(
    patient_id: Uuid,
    now: DateTime<Utc>,
    conflicts: &[&'a Reservation],
) -> Option<&'a Reservation> {
    let window = Duration::seconds(DUPLICATE_SUBMISSION_WINDOW_SECS);
    conflicts
        .iter()
        .find(|r| r.patient_id == patient_id && now - r.created_at <= window)
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LocationMode, ReservationStatus};
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, hour, minute, 0).unwrap()
    }

    fn reservation(patient_id: Uuid, created_at: DateTime<Utc>) -> Reservation {
        Reservation {
            id: Uuid::new_v4(),
            provider_id: Uuid::new_v4(),
            patient_id,
            service_instance_id: Uuid::new_v4(),
            start_time: at(10, 0),
            end_time: at(10, 30),
            duration_minutes: 30,
            location_mode: LocationMode::Telehealth,
            status: ReservationStatus::Scheduled,
            sync_log: None,
            ehr_appointment_id: None,
            note: None,
            created_at,
            updated_at: created_at,
        }
    }

    #[test]
    fn touching_boundaries_do_not_conflict() {
        assert!(!intervals_overlap(at(10, 0), at(10, 30), at(10, 30), at(11, 0)));
        assert!(!intervals_overlap(at(10, 30), at(11, 0), at(10, 0), at(10, 30)));
    }

    #[test]
    fn partial_overlap_conflicts() {
        assert!(intervals_overlap(at(10, 0), at(10, 30), at(10, 15), at(10, 45)));
    }

    #[test]
    fn containment_conflicts_both_directions() {
        assert!(intervals_overlap(at(10, 0), at(11, 0), at(10, 15), at(10, 45)));
        assert!(intervals_overlap(at(10, 15), at(10, 45), at(10, 0), at(11, 0)));
    }

    #[test]
    fn recent_same_patient_conflict_is_duplicate_submission() {
        let patient = Uuid::new_v4();
        let now = Utc::now();
        let row = reservation(patient, now - Duration::seconds(5));
        let conflicts = vec![&row];

        let found = find_duplicate_submission(patient, now, &conflicts);
        assert_eq!(found.map(|r| r.id), Some(row.id));
    }

    #[test]
    fn stale_same_patient_conflict_is_genuine() {
        let patient = Uuid::new_v4();
        let now = Utc::now();
        let row = reservation(patient, now - Duration::seconds(35));
        let conflicts = vec![&row];

        assert!(find_duplicate_submission(patient, now, &conflicts).is_none());
    }

    #[test]
    fn other_patients_conflict_is_genuine_even_when_recent() {
        let now = Utc::now();
        let row = reservation(Uuid::new_v4(), now - Duration::seconds(5));
        let conflicts = vec![&row];

        assert!(find_duplicate_submission(Uuid::new_v4(), now, &conflicts).is_none());
    }
}
