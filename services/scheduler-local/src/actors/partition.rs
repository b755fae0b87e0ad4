//! Partition actor - the single writer of the subset partition.
//!
//! The actor exclusively owns the [`SubsetManager`]. Commands from the API
//! and sampling results from the scheduler loop arrive on one ordered
//! mailbox, so placements, evictions and reconciliation passes never
//! interleave. Hypervisor side effects of a command run inside the same
//! message, so a placement is either applied everywhere or rolled back.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

use super::framework::{Actor, ActorContext, ActorError};
use crate::domain::{Domain, DomainId, DomainSpec};
use crate::endpoint::{Sample, SampleKind, SubsetView};
use crate::error::SchedulerError;
use crate::hypervisor::Hypervisor;
use crate::manager::{
    PartitionSnapshot, PinUpdate, Placement, PlacementError, ReconcileReport, SubsetManager,
    UtilizationView,
};
use crate::topology::ResourceKind;

// =============================================================================
// Messages
// =============================================================================

type Reply<T> = oneshot::Sender<Result<T, SchedulerError>>;

/// How an eviction names its domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvictTarget {
    Uuid(DomainId),
    Name(String),
}

/// Loader output for one subset. `samples` is `None` when the loader
/// failed; the subset's domains are then skipped for the tick.
#[derive(Debug, Clone)]
pub struct SampledSubset {
    pub view: SubsetView,
    pub samples: Option<Vec<Sample>>,
}

/// What one applied sampling pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickSummary {
    pub tick: u64,
    /// Domain records that produced a reading.
    pub sampled: usize,
    /// Hosted domains with no record (cleared, counted as 0).
    pub absent: usize,
    /// Domains present but unreadable, or behind a failed loader.
    pub skipped: usize,
    pub report: ReconcileReport,
}

/// Messages handled by PartitionActor.
#[derive(Debug)]
pub enum PartitionMessage {
    /// Validate, place and create a domain.
    Place { spec: DomainSpec, reply: Reply<Placement> },

    /// Evict and destroy a domain.
    Evict {
        target: EvictTarget,
        reply: Reply<DomainId>,
    },

    /// Current partition and utilization.
    Describe { reply: Reply<PartitionSnapshot> },

    /// Subset views for the sampling phase.
    Snapshot { reply: Reply<Vec<SubsetView>> },

    /// Results of one sampling pass; triggers reconciliation.
    ApplySamples {
        tick: u64,
        subsets: Vec<SampledSubset>,
        reply: Reply<TickSummary>,
    },
}

impl PartitionMessage {
    fn reject(self) {
        use SchedulerError::ShuttingDown;
        // A dropped receiver means the caller stopped waiting.
        match self {
            Self::Place { reply, .. } => {
                let _ = reply.send(Err(ShuttingDown));
            }
            Self::Evict { reply, .. } => {
                let _ = reply.send(Err(ShuttingDown));
            }
            Self::Describe { reply } => {
                let _ = reply.send(Err(ShuttingDown));
            }
            Self::Snapshot { reply } => {
                let _ = reply.send(Err(ShuttingDown));
            }
            Self::ApplySamples { reply, .. } => {
                let _ = reply.send(Err(ShuttingDown));
            }
        }
    }
}

// =============================================================================
// Actor
// =============================================================================

pub struct PartitionActor {
    manager: SubsetManager,
    hypervisor: Arc<dyn Hypervisor>,
}

impl PartitionActor {
    pub fn new(manager: SubsetManager, hypervisor: Arc<dyn Hypervisor>) -> Self {
        Self {
            manager,
            hypervisor,
        }
    }

    #[instrument(skip(self, spec), fields(name = ?spec.name))]
    async fn place(&mut self, spec: DomainSpec) -> Result<Placement, SchedulerError> {
        let domain = Domain::new(spec.with_generated_fields())?;
        let uuid = domain.uuid();

        let checkpoint = self.manager.checkpoint();
        let placement = self.manager.place(domain)?;
        let placed = self
            .manager
            .domain(uuid)
            .cloned()
            .ok_or(PlacementError::NotFound(uuid))?;

        let created = async {
            self.hypervisor.create(&placed).await?;
            if let Some(own) = placement.pin_updates.first() {
                self.push_pins(own).await?;
            }
            Ok::<_, SchedulerError>(())
        }
        .await;

        if let Err(e) = created {
            warn!(uuid = %uuid, error = %e, "Hypervisor rejected domain, rolling back");
            if let Err(destroy_err) = self.hypervisor.destroy(uuid).await {
                debug!(uuid = %uuid, error = %destroy_err, "Nothing to destroy on rollback");
            }
            self.manager.restore(checkpoint);
            return Err(e);
        }

        for update in placement.pin_updates.iter().skip(1) {
            if let Err(e) = self.push_pins(update).await {
                warn!(uuid = %update.uuid, error = %e, "Failed to re-pin domain");
            }
        }
        Ok(placement)
    }

    #[instrument(skip(self))]
    async fn evict(&mut self, target: EvictTarget) -> Result<DomainId, SchedulerError> {
        let uuid = match target {
            EvictTarget::Uuid(uuid) => uuid,
            EvictTarget::Name(name) => self
                .manager
                .find_by_name(&name)
                .ok_or(PlacementError::NameNotFound(name))?,
        };

        let domain = self.manager.evict(uuid)?;
        if let Err(e) = self.hypervisor.destroy(uuid).await {
            // The partition change stands; the domain is gone from scheduling.
            warn!(uuid = %uuid, name = %domain.name(), error = %e, "Failed to destroy domain");
        }
        Ok(uuid)
    }

    async fn push_pins(&self, update: &PinUpdate) -> Result<(), SchedulerError> {
        for (vcpu, cpus) in update.pins.iter().enumerate() {
            self.hypervisor.pin(update.uuid, vcpu, cpus).await?;
        }
        Ok(())
    }

    /// Fold one sampling pass into the domains, then reconcile.
    fn apply_samples(&mut self, tick: u64, subsets: Vec<SampledSubset>) -> TickSummary {
        let mut summary = TickSummary {
            tick,
            ..TickSummary::default()
        };
        let mut view = UtilizationView::new();

        for sampled in subsets {
            let kind = sampled.view.kind;
            let Some(samples) = sampled.samples else {
                summary.skipped += sampled.view.domains.len();
                continue;
            };

            let records: HashMap<DomainId, &Sample> = samples
                .iter()
                .filter(|s| s.kind == SampleKind::Domain && s.resource == kind)
                .filter_map(|s| s.domain_id().map(|id| (id, s)))
                .collect();

            for domain in &sampled.view.domains {
                let uuid = domain.uuid;
                match records.get(&uuid) {
                    None => {
                        // Absent: stale readings must not be reported.
                        if let Err(e) = self.manager.clear_domain_time(uuid) {
                            debug!(uuid = %uuid, error = %e, "Domain left before samples applied");
                        }
                        view.mark_absent(kind, uuid);
                        summary.absent += 1;
                    }
                    Some(record) => match (record.counters, record.value) {
                        (Some(counters), value) if kind == ResourceKind::Cpu => {
                            match self.manager.set_domain_time(uuid, counters) {
                                Ok(Some(utilization)) => {
                                    view.insert(kind, uuid, utilization);
                                    summary.sampled += 1;
                                }
                                Ok(None) => {
                                    if let Some(value) = value {
                                        view.insert(kind, uuid, value);
                                    }
                                    summary.sampled += 1;
                                }
                                Err(e) => debug!(uuid = %uuid, error = %e, "Sample for departed domain"),
                            }
                        }
                        (_, Some(value)) => {
                            view.insert(kind, uuid, value);
                            summary.sampled += 1;
                        }
                        (_, None) => summary.skipped += 1,
                    },
                }
            }
        }

        summary.report = self.manager.reconcile(&view);
        if !summary.report.is_noop() {
            info!(
                tick,
                ratio_changes = summary.report.ratio_changes.len(),
                released = summary.report.released.len(),
                "Reconciled partition"
            );
        }
        summary
    }
}

#[async_trait]
impl Actor for PartitionActor {
    type Message = PartitionMessage;

    fn name(&self) -> &str {
        "partition"
    }

    async fn handle(
        &mut self,
        msg: PartitionMessage,
        _ctx: &mut ActorContext,
    ) -> Result<bool, ActorError> {
        match msg {
            PartitionMessage::Place { spec, reply } => {
                let result = self.place(spec).await;
                let _ = reply.send(result);
            }
            PartitionMessage::Evict { target, reply } => {
                let result = self.evict(target).await;
                let _ = reply.send(result);
            }
            PartitionMessage::Describe { reply } => {
                let _ = reply.send(Ok(self.manager.describe()));
            }
            PartitionMessage::Snapshot { reply } => {
                let _ = reply.send(Ok(self.manager.subset_views()));
            }
            PartitionMessage::ApplySamples {
                tick,
                subsets,
                reply,
            } => {
                let summary = self.apply_samples(tick, subsets);
                let _ = reply.send(Ok(summary));
            }
        }

        if let Err(violation) = self.manager.check_invariants() {
            return Err(ActorError::Permanent(violation));
        }
        Ok(true)
    }

    fn reject(&mut self, msg: PartitionMessage) {
        msg.reject();
    }

    async fn on_stop(&mut self, _ctx: &mut ActorContext) {
        info!(
            domains = self.manager.domains().count(),
            subsets = self.manager.subsets().count(),
            "Partition actor stopping"
        );
    }
}
