use axum::{routing::get, Json, Router};
use serde_json::json;

use booking_cell::handlers::BookingState;
use booking_cell::router::booking_routes;

pub fn create_router(state: BookingState) -> Router {
    Router::new()
        .route("/", get(|| async { "Booking API is running!" }))
        .route(
            "/health",
            get(|| async { Json(json!({ "status": "ok" })) }),
        )
        .merge(booking_routes(state))
}
