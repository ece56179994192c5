//! Admin HTTP routes.

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::node::NodeState;

mod health;

/// Create the admin router
pub fn create_router(state: NodeState) -> Router {
    Router::new()
        // Health & Status
        .route("/health", get(health::health_check))
        .route("/ready", get(health::ready_check))
        .route("/metrics", get(health::metrics))

        // Cluster view
        .route("/members", get(health::members))

        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
