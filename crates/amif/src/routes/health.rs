//! Health check endpoints.

use amif_common::ModuleRecord;
use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;

use crate::broker::BrokerStatsSnapshot;
use crate::discovery::GossipStatsSnapshot;
use crate::node::NodeState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Basic health check (is the server running?)
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
pub struct ReadyResponse {
    status: &'static str,
    backend: bool,
    discovery: bool,
}

/// Readiness check: backend reachable and gossip loops running
pub async fn ready_check(State(state): State<NodeState>) -> Result<Json<ReadyResponse>, StatusCode> {
    let backend = state.broker.ping().await;
    let discovery = state.discovery.is_running();

    if backend && discovery {
        Ok(Json(ReadyResponse {
            status: "ready",
            backend,
            discovery,
        }))
    } else {
        tracing::debug!(backend, discovery, "Not ready");
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

/// Every known record, ALIVE or not
pub async fn members(State(state): State<NodeState>) -> Json<Vec<ModuleRecord>> {
    Json(state.discovery.snapshot().await)
}

#[derive(Serialize)]
pub struct MetricsResponse {
    node_id: String,
    incarnation: Option<u64>,
    alive_members: usize,
    uptime_secs: u64,
    broker: BrokerStatsSnapshot,
    gossip: GossipStatsSnapshot,
}

/// Metrics endpoint (for monitoring)
pub async fn metrics(State(state): State<NodeState>) -> Json<MetricsResponse> {
    let local = state.discovery.local_record().await;

    Json(MetricsResponse {
        node_id: state.node_id().to_string(),
        incarnation: local.map(|r| r.incarnation),
        alive_members: state.discovery.members().await.len(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        broker: state.broker.stats(),
        gossip: state.discovery.stats(),
    })
}
