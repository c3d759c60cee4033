// libs/booking-cell/src/handlers.rs
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use shared_models::AppError;

use crate::models::{BookReservationRequest, BookingResponse, Reservation};
use crate::services::orchestrator::BookingOrchestrator;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

#[derive(Clone)]
pub struct BookingState {
    pub orchestrator: Arc<BookingOrchestrator>,
}

/// POST /bookings
pub async fn book_reservation(
    State(state): State<BookingState>,
    headers: HeaderMap,
    Json(request): Json<BookReservationRequest>,
) -> Result<Json<BookingResponse>, AppError> {
    let idempotency_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    info!(
        "Booking request for provider {} at {} (idempotency key: {})",
        request.provider_id,
        request.start_time,
        idempotency_key.as_deref().unwrap_or("none")
    );

    let response = state.orchestrator.book(request, idempotency_key).await?;
    Ok(Json(response))
}

/// GET /bookings/{reservation_id}
pub async fn get_booking(
    State(state): State<BookingState>,
    Path(reservation_id): Path<Uuid>,
) -> Result<Json<Reservation>, AppError> {
    let reservation = state.orchestrator.get_reservation(reservation_id).await?;
    Ok(Json(reservation))
}

#[derive(Debug, Deserialize)]
pub struct ConflictCheckQuery {
    pub provider_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ConflictCheckResponse {
    pub available: bool,
    pub conflicting_reservation_id: Option<Uuid>,
}

/// GET /bookings/conflicts/check. Advisory; the booking path re-checks at
/// write time.
pub async fn check_conflicts(
    State(state): State<BookingState>,
    Query(query): Query<ConflictCheckQuery>,
) -> Result<Json<ConflictCheckResponse>, AppError> {
    if query.end_time <= query.start_time {
        return Err(AppError::BadRequest(
            "end_time must be after start_time".to_string(),
        ));
    }

    let conflicting = state
        .orchestrator
        .check_availability(query.provider_id, query.start_time, query.end_time)
        .await?;

    Ok(Json(ConflictCheckResponse {
        available: conflicting.is_none(),
        conflicting_reservation_id: conflicting,
    }))
}
