//! HTTP command API.

mod domains;
pub mod error;
mod health;

use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::scheduler::SchedulerHandle;
use crate::topology::Topology;

pub use domains::{DeployQuery, DeployResponse, RemoveResponse};

/// Shared state of the API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub handle: SchedulerHandle,
    pub topology: Arc<Topology>,
}

/// Create the API router with all routes and middleware.
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .merge(health::routes())
        .merge(domains::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
