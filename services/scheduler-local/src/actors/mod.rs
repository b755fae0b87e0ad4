//! Actor framework for the local scheduler.
//!
//! ## Design Principles
//!
//! - **Single writer**: the partition is owned by one actor; every mutation
//!   is a message on its mailbox, processed in arrival order.
//! - **No I/O in the critical section**: sampling happens outside the actor
//!   against a snapshot; only the results are applied inside it.
//! - **Explicit shutdown**: queued commands are answered with a
//!   shutting-down error instead of being dropped.

mod framework;
mod partition;

pub use framework::{spawn, Actor, ActorContext, ActorError, ActorHandle, ActorRef, BackoffPolicy, Message};
pub use partition::{
    EvictTarget, PartitionActor, PartitionMessage, SampledSubset, TickSummary,
};
