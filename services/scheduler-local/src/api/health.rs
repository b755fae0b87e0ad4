//! Health check endpoint.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use super::ApiState;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// "ok", or "stopping" once the partition no longer accepts commands.
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: String,
    pub cpus: usize,
    pub numa_nodes: usize,
}

pub fn routes() -> Router<ApiState> {
    Router::new().route("/healthz", get(healthz))
}

async fn healthz(State(state): State<ApiState>) -> impl IntoResponse {
    let ok = state.handle.describe().await.is_ok();
    let response = HealthResponse {
        status: if ok { "ok" } else { "stopping" }.to_string(),
        service: "scheduler-local".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        cpus: state.topology.cpus().count(),
        numa_nodes: state.topology.nodes().count(),
    };

    if ok {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}
