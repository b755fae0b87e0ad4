//! Domain deployment endpoints.
//!
//! `deploy`, `remove` and `info` accept the query-string form used by the
//! command-line client as well as JSON.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::error::ApiError;
use super::ApiState;
use crate::actors::EvictTarget;
use crate::domain::{DomainId, DomainSpec};
use crate::subset::SubsetId;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/deploy", post(deploy))
        .route("/remove", post(remove))
        .route("/domains/{uuid}", delete(remove_by_path))
        .route("/info", get(info).post(info))
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Query-string form of a deployment.
#[derive(Debug, Default, Deserialize)]
pub struct DeployQuery {
    pub name: Option<String>,
    /// vCPU count.
    pub cpu: Option<u32>,
    /// Memory in GiB.
    pub memory: Option<f64>,
    /// CPU oversubscription the domain accepts.
    pub oc: Option<f64>,
    /// Disk image; handed to the hypervisor connector, not scheduled.
    pub qcow2: Option<String>,
}

impl DeployQuery {
    fn into_spec(self) -> DomainSpec {
        DomainSpec {
            uuid: None,
            name: self.name,
            memory_bytes: self.memory.map(|gb| (gb * GIB).round() as u64),
            cpu_count: self.cpu,
            cpu_pin: None,
            cpu_ratio: Some(self.oc.unwrap_or(1.0)),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeployResponse {
    pub uuid: DomainId,
    pub cpu_subset: SubsetId,
    pub memory_subset: SubsetId,
}

#[derive(Debug, Deserialize)]
pub struct RemoveQuery {
    pub uuid: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RemoveResponse {
    pub uuid: DomainId,
}

// =============================================================================
// Handlers
// =============================================================================

async fn deploy(
    State(state): State<ApiState>,
    Query(query): Query<DeployQuery>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let disk = query.qcow2.clone();
    let spec = if body.is_empty() {
        query.into_spec()
    } else {
        serde_json::from_slice::<DomainSpec>(&body)
            .map_err(|e| ApiError::bad_request("validation_failed", format!("invalid body: {e}")))?
    };

    let placement = state.handle.place(spec).await?;
    info!(
        uuid = %placement.uuid,
        cpu_subset = %placement.cpu_subset,
        memory_subset = %placement.memory_subset,
        disk = ?disk,
        "Deployed domain"
    );

    Ok((
        StatusCode::CREATED,
        Json(DeployResponse {
            uuid: placement.uuid,
            cpu_subset: placement.cpu_subset,
            memory_subset: placement.memory_subset,
        }),
    ))
}

async fn remove(
    State(state): State<ApiState>,
    Query(query): Query<RemoveQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let target = match (query.uuid, query.name) {
        (Some(uuid), _) => EvictTarget::Uuid(parse_uuid(&uuid)?),
        (None, Some(name)) => EvictTarget::Name(name),
        (None, None) => {
            return Err(ApiError::bad_request(
                "validation_failed",
                "either 'uuid' or 'name' is required",
            ))
        }
    };
    evict(state, target).await
}

async fn remove_by_path(
    State(state): State<ApiState>,
    Path(uuid): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    evict(state, EvictTarget::Uuid(parse_uuid(&uuid)?)).await
}

async fn evict(state: ApiState, target: EvictTarget) -> Result<Json<RemoveResponse>, ApiError> {
    let uuid = state.handle.evict(target).await?;
    info!(uuid = %uuid, "Removed domain");
    Ok(Json(RemoveResponse { uuid }))
}

async fn info(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.handle.describe().await?))
}

fn parse_uuid(raw: &str) -> Result<DomainId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request("validation_failed", format!("invalid uuid '{raw}'")))
}
