pub mod admin;
pub mod health;
pub mod receipts;
pub mod webhook;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/webhook", get(webhook::verify).post(webhook::receive))
        .route("/receipts/:booking_id", get(receipts::download_receipt))
        .route("/api/admin/status", get(admin::get_status))
        .route("/api/admin/bookings", get(admin::get_bookings))
        .route(
            "/api/admin/slots",
            get(admin::get_slots).post(admin::create_slots),
        )
        .route("/api/admin/slots/:id/release", post(admin::release_slot))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
