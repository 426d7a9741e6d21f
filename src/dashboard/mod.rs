//! Read-only HTTP view of one node's membership state.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::coordinator::{CoordinationStrategy, RdbmsCoordinationStrategy};

#[derive(Clone)]
pub struct DashboardState {
    pub strategy: Arc<RdbmsCoordinationStrategy>,
}

#[derive(Serialize)]
struct ClusterStatusResponse {
    node_id: String,
    group_id: String,
    role: String,
    leader_id: Option<String>,
    members: Vec<MemberResponse>,
}

#[derive(Serialize)]
struct MemberResponse {
    node_id: String,
    is_coordinator: bool,
    last_heartbeat_ms: Option<i64>,
    properties: serde_json::Value,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/cluster", get(cluster_status_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn cluster_status_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let strategy = &state.strategy;

    let members = match strategy.get_all_node_details().await {
        Ok(members) => members,
        Err(e) => {
            tracing::warn!(error = %e, "Dashboard could not list members");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response();
        }
    };

    let leader_id = strategy.get_leader_node().await.map(|n| n.node_id);

    let members = members
        .into_iter()
        .map(|m| MemberResponse {
            node_id: m.node_id,
            is_coordinator: m.is_coordinator,
            last_heartbeat_ms: m.last_heartbeat.map(|t| t.timestamp_millis()),
            properties: serde_json::Value::Object(m.properties.into_iter().collect()),
        })
        .collect();

    Json(ClusterStatusResponse {
        node_id: strategy.node_id().to_string(),
        group_id: strategy.group_id().to_string(),
        role: strategy.role().await.to_string(),
        leader_id,
        members,
    })
    .into_response()
}
