//! Scheduler loop.
//!
//! Every tick the loop:
//! - takes subset views from the partition actor
//! - samples every subset concurrently through the endpoint pool, outside
//!   the partition's critical section
//! - hands the whole sampling pass back to the actor, which updates domain
//!   time samples and reconciles ratios
//!
//! Commands reach the same actor through [`SchedulerHandle`] at any time and
//! are serialized with the ticks by its mailbox.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use tokio::sync::{oneshot, watch};
use tokio::time::MissedTickBehavior;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::actors::{
    spawn, ActorHandle, ActorRef, EvictTarget, PartitionActor, PartitionMessage, SampledSubset,
    TickSummary,
};
use crate::domain::{DomainId, DomainSpec};
use crate::endpoint::{EndpointPool, Sample, SampleKind, SubsetView};
use crate::error::SchedulerError;
use crate::hypervisor::Hypervisor;
use crate::manager::{PartitionSnapshot, Placement, SubsetManager};
use crate::topology::{ResourceKind, Topology};

/// Loop settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Period between sampling passes.
    pub tick: Duration,

    /// Commands queued on the partition actor before senders wait.
    pub mailbox_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(200),
            mailbox_size: 256,
        }
    }
}

/// Where the loop is within a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Sampling,
    Reconciling,
}

// =============================================================================
// Handle
// =============================================================================

/// Command interface to the partition. Cheap to clone.
#[derive(Clone)]
pub struct SchedulerHandle {
    actor: ActorHandle<PartitionMessage>,
}

impl SchedulerHandle {
    /// Spawn the partition actor owning `manager`.
    pub fn spawn(
        manager: SubsetManager,
        hypervisor: Arc<dyn Hypervisor>,
        mailbox_size: usize,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, ActorRef) {
        let actor = PartitionActor::new(manager, hypervisor);
        let (actor, actor_ref) = spawn(actor, mailbox_size, shutdown);
        (Self { actor }, actor_ref)
    }

    async fn request<T>(
        &self,
        message: impl FnOnce(oneshot::Sender<Result<T, SchedulerError>>) -> PartitionMessage,
    ) -> Result<T, SchedulerError> {
        let (tx, rx) = oneshot::channel();
        self.actor
            .send(message(tx))
            .await
            .map_err(|_| SchedulerError::ShuttingDown)?;
        rx.await.map_err(|_| SchedulerError::ShuttingDown)?
    }

    pub async fn place(&self, spec: DomainSpec) -> Result<Placement, SchedulerError> {
        self.request(|reply| PartitionMessage::Place { spec, reply })
            .await
    }

    pub async fn evict(&self, target: EvictTarget) -> Result<DomainId, SchedulerError> {
        self.request(|reply| PartitionMessage::Evict { target, reply })
            .await
    }

    pub async fn describe(&self) -> Result<PartitionSnapshot, SchedulerError> {
        self.request(|reply| PartitionMessage::Describe { reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<Vec<SubsetView>, SchedulerError> {
        self.request(|reply| PartitionMessage::Snapshot { reply })
            .await
    }

    pub async fn apply_samples(
        &self,
        tick: u64,
        subsets: Vec<SampledSubset>,
    ) -> Result<TickSummary, SchedulerError> {
        self.request(|reply| PartitionMessage::ApplySamples {
            tick,
            subsets,
            reply,
        })
        .await
    }
}

// =============================================================================
// Loop
// =============================================================================

/// Everything the loop needs, passed at construction.
pub struct SchedulerContext {
    pub topology: Arc<Topology>,
    pub handle: SchedulerHandle,
    pub pool: EndpointPool,
    pub config: SchedulerConfig,
}

pub struct Scheduler {
    ctx: SchedulerContext,
    phase: Phase,
    ticks: u64,
}

impl Scheduler {
    pub fn new(ctx: SchedulerContext) -> Self {
        Self {
            ctx,
            phase: Phase::Idle,
            ticks: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn pool(&self) -> &EndpointPool {
        &self.ctx.pool
    }

    /// Run until shutdown. The in-flight tick completes, then savers are
    /// flushed and stopped. Returns the number of ticks whose samples were
    /// applied.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> u64 {
        info!(
            tick_ms = self.ctx.config.tick.as_millis() as u64,
            loader = %self.ctx.pool.loader_name(),
            savers = ?self.ctx.pool.saver_names(),
            cpus = self.ctx.topology.cpus().count(),
            "Starting scheduler loop"
        );

        let mut interval = tokio::time::interval(self.ctx.config.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut applied = 0;

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Scheduler shutting down");
                        break;
                    }
                }
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(_) => applied += 1,
                        Err(SchedulerError::ShuttingDown) => {
                            info!("Partition stopped, leaving scheduler loop");
                            break;
                        }
                        Err(e) => warn!(error = %e, "Tick failed"),
                    }
                }
            }
        }

        self.ctx.pool.shutdown().await;
        info!(ticks = self.ticks, applied, "Scheduler stopped");
        applied
    }

    /// One sampling and reconciliation pass.
    #[instrument(skip(self), fields(tick = self.ticks + 1))]
    pub async fn tick(&mut self) -> Result<TickSummary, SchedulerError> {
        self.ticks += 1;
        let result = self.sample_and_reconcile().await;
        self.phase = Phase::Idle;
        result
    }

    async fn sample_and_reconcile(&mut self) -> Result<TickSummary, SchedulerError> {
        self.phase = Phase::Sampling;
        let views = self.ctx.handle.snapshot().await?;
        let timestamp = Utc::now();

        let pool = &self.ctx.pool;
        let loaded = join_all(views.iter().map(|view| pool.sample(timestamp, view))).await;

        let mut totals: BTreeMap<ResourceKind, f64> = BTreeMap::new();
        let subsets: Vec<SampledSubset> = views
            .into_iter()
            .zip(loaded)
            .map(|(view, result)| {
                let samples = match result {
                    Ok(samples) => {
                        *totals.entry(view.kind).or_default() += samples
                            .iter()
                            .filter(|s| s.kind == SampleKind::Subset)
                            .filter_map(|s| s.value)
                            .sum::<f64>();
                        Some(samples)
                    }
                    Err(e) => {
                        warn!(subset = %view.id, error = %e, "Loader failed, skipping subset");
                        None
                    }
                };
                SampledSubset { view, samples }
            })
            .collect();

        let global: Vec<Sample> = totals
            .into_iter()
            .map(|(kind, value)| Sample::global(timestamp, kind, value))
            .collect();
        pool.record(&global);

        self.phase = Phase::Reconciling;
        let summary = self.ctx.handle.apply_samples(self.ticks, subsets).await?;

        debug!(
            sampled = summary.sampled,
            absent = summary.absent,
            skipped = summary.skipped,
            ratio_changes = summary.report.ratio_changes.len(),
            released = summary.report.released.len(),
            "Tick applied"
        );
        Ok(summary)
    }
}

// =============================================================================
// Shutdown
// =============================================================================

/// Two-stage stop. The loop gets its own signal so that its in-flight tick
/// can still reach the partition actor; the actor is signaled only after
/// the loop has exited and flushed its savers.
#[derive(Debug)]
pub struct Shutdown {
    loop_tx: watch::Sender<bool>,
    partition_tx: watch::Sender<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            loop_tx: watch::channel(false).0,
            partition_tx: watch::channel(false).0,
        }
    }

    /// Signal for the scheduler loop and the command API.
    pub fn loop_signal(&self) -> watch::Receiver<bool> {
        self.loop_tx.subscribe()
    }

    /// Signal for the partition actor.
    pub fn partition_signal(&self) -> watch::Receiver<bool> {
        self.partition_tx.subscribe()
    }

    /// Stop the loop, wait for it, then stop the partition actor. Each wait
    /// is bounded by `timeout`. Returns the loop's applied tick count when
    /// it exited in time.
    pub async fn stop(
        self,
        scheduler: JoinHandle<u64>,
        partition: ActorRef,
        timeout: Duration,
    ) -> Option<u64> {
        let _ = self.loop_tx.send(true);
        let applied = match tokio::time::timeout(timeout, scheduler).await {
            Ok(Ok(applied)) => Some(applied),
            Ok(Err(e)) => {
                error!(error = %e, "Scheduler task panicked");
                None
            }
            Err(_) => {
                warn!("Scheduler did not shut down in time");
                None
            }
        };

        let _ = self.partition_tx.send(true);
        if tokio::time::timeout(timeout, partition.join()).await.is_err() {
            warn!("Partition actor did not shut down in time");
        }
        applied
    }
}
