use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use tracelink_core::health::healthz;
use tracelink_core::middleware::{propagate_request_id_layer, request_id_layer};

use crate::handlers::{
    outbox::{get_outbox_health, list_dead_letters, requeue_dead_letter},
    ready::readyz,
};
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Outbox operations
        .route("/outbox/health", get(get_outbox_health))
        .route("/outbox/dead-letters", get(list_dead_letters))
        .route(
            "/outbox/dead-letters/{id}/requeue",
            post(requeue_dead_letter),
        )
        .with_state(state)
        .layer(propagate_request_id_layer())
        .layer(TraceLayer::new_for_http())
        .layer(request_id_layer())
}
