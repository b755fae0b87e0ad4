//! Top-level scheduler errors.

use thiserror::Error;

use crate::domain::ValidationError;
use crate::endpoint::EndpointError;
use crate::hypervisor::HypervisorError;
use crate::manager::PlacementError;
use crate::topology::TopologyError;

/// Errors surfaced by the scheduler, with standardized reason codes.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Malformed domain description.
    #[error("validation_failed: {0}")]
    Validation(#[from] ValidationError),

    /// Placement, eviction or subset operation rejected.
    #[error(transparent)]
    Placement(#[from] PlacementError),

    /// Hypervisor call failed.
    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    /// Sampling endpoint failed.
    #[error("endpoint error: {0}")]
    Endpoint(#[from] EndpointError),

    /// Malformed topology (startup only).
    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),

    /// The scheduler is stopping and no longer accepts commands.
    #[error("scheduler is shutting down")]
    ShuttingDown,
}

impl SchedulerError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            SchedulerError::Validation(_) => "validation_failed",
            SchedulerError::Placement(e) => e.reason_code(),
            SchedulerError::Hypervisor(_) => "hypervisor_error",
            SchedulerError::Endpoint(e) => e.reason_code(),
            SchedulerError::Topology(_) => "topology_error",
            SchedulerError::ShuttingDown => "shutting_down",
        }
    }
}
