//! vmsched local scheduler library.
//!
//! Partitions a host's CPUs and memory into single-NUMA-node subsets,
//! places virtual machines into them, and adjusts each subset's
//! oversubscription ratio from sampled utilization.
//!
//! ## Architecture
//!
//! ```text
//! api ──► SchedulerHandle ──► PartitionActor (owns SubsetManager)
//!                                   ▲
//! Scheduler loop ── EndpointPool ───┘  (sample outside, apply inside)
//! ```
//!
//! ## Modules
//!
//! - `topology`: NUMA layout, resource units, host explorer
//! - `domain` / `subset` / `manager`: the partition model
//! - `endpoint`: sample loaders and savers
//! - `hypervisor`: connector contract and in-memory mock
//! - `actors` / `scheduler`: single-writer actor and the tick loop
//! - `api`: HTTP command API

pub mod actors;
pub mod api;
pub mod config;
pub mod domain;
pub mod endpoint;
pub mod error;
pub mod hypervisor;
pub mod manager;
pub mod scheduler;
pub mod subset;
pub mod topology;

// Re-export commonly used types
pub use domain::{Domain, DomainId, DomainSpec};
pub use error::SchedulerError;
pub use manager::{ManagerConfig, SubsetManager};
pub use scheduler::{Scheduler, SchedulerContext, SchedulerHandle, Shutdown};
pub use subset::{Subset, SubsetId};
pub use topology::{ResourceKind, Topology};
