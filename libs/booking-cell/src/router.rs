// libs/booking-cell/src/router.rs
use axum::{
    routing::{get, post},
    Router,
};

use crate::handlers::{self, BookingState};

pub fn booking_routes(state: BookingState) -> Router {
    Router::new()
        .route("/bookings", post(handlers::book_reservation))
        .route("/bookings/conflicts/check", get(handlers::check_conflicts))
        .route("/bookings/{reservation_id}", get(handlers::get_booking))
        .with_state(state)
}
