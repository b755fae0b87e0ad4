//! Subset manager: owns the partition of the topology into subsets.
//!
//! ## Invariants
//!
//! - Subsets of one kind own pairwise-disjoint units.
//! - Every subset's hosted demand fits its capacity.
//! - Every placed domain is hosted by exactly one subset per kind, and the
//!   per-kind reverse index matches the subsets' hosted lists.
//!
//! Every mutating operation is all-or-nothing: on error the partition is
//! left exactly as it was.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use vmsched_reconcile::{RatioDecision, RatioPolicy, SmoothingWindow};

use crate::domain::{utilization_between, CpuPin, CpuTime, Domain, DomainId};
use crate::endpoint::{DomainView, SubsetView};
use crate::subset::{Subset, SubsetError, SubsetId};
use crate::topology::{ResourceKind, Topology};

/// Slack applied before rounding unit counts up.
const UNIT_EPSILON: f64 = 1e-9;

// =============================================================================
// Errors and results
// =============================================================================

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlacementError {
    #[error("no capacity for {kind} request of domain {uuid}")]
    NoCapacity { uuid: DomainId, kind: ResourceKind },

    #[error("domain {0} is already placed")]
    AlreadyPlaced(DomainId),

    #[error("a domain named '{0}' is already placed")]
    NameTaken(String),

    #[error("domain {0} not found")]
    NotFound(DomainId),

    #[error("no domain named '{0}'")]
    NameNotFound(String),

    #[error("{0} not found")]
    SubsetNotFound(SubsetId),

    #[error(transparent)]
    Subset(#[from] SubsetError),
}

impl PlacementError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::NoCapacity { .. } => "no_capacity",
            Self::AlreadyPlaced(_) | Self::NameTaken(_) => "already_placed",
            Self::NotFound(_) | Self::NameNotFound(_) | Self::SubsetNotFound(_) => "not_found",
            Self::Subset(e) => e.reason_code(),
        }
    }
}

/// New CPU pins of a domain, to be pushed to the hypervisor.
#[derive(Debug, Clone, PartialEq)]
pub struct PinUpdate {
    pub uuid: DomainId,
    pub pins: CpuPin,
}

/// Outcome of a successful placement.
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub uuid: DomainId,
    pub cpu_subset: SubsetId,
    pub memory_subset: SubsetId,
    /// Pins of the placed domain first, then any domain re-pinned by growth.
    pub pin_updates: Vec<PinUpdate>,
}

/// Per-domain utilization for one tick, by resource kind.
///
/// A hosted domain without an entry has undefined utilization this tick,
/// and its subsets are held. Domains that left the hypervisor are marked
/// absent and count 0.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UtilizationView {
    per_domain: HashMap<(ResourceKind, DomainId), f64>,
}

impl UtilizationView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kind: ResourceKind, uuid: DomainId, utilization: f64) {
        self.per_domain.insert((kind, uuid), utilization);
    }

    pub fn mark_absent(&mut self, kind: ResourceKind, uuid: DomainId) {
        self.per_domain.insert((kind, uuid), 0.0);
    }

    pub fn get(&self, kind: ResourceKind, uuid: DomainId) -> Option<f64> {
        self.per_domain.get(&(kind, uuid)).copied()
    }

    pub fn len(&self) -> usize {
        self.per_domain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.per_domain.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RatioChange {
    pub subset: SubsetId,
    pub from: f64,
    pub to: f64,
}

/// What one reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub ratio_changes: Vec<RatioChange>,
    pub released: Vec<SubsetId>,
    /// Utilization per subset, as aggregated this pass.
    pub utilization: BTreeMap<SubsetId, f64>,
    /// Subsets left untouched because a hosted domain had no reading.
    pub held: Vec<SubsetId>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.ratio_changes.is_empty() && self.released.is_empty()
    }
}

// =============================================================================
// Snapshot
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubsetSnapshot {
    pub id: SubsetId,
    pub kind: ResourceKind,
    pub numa_node: u32,
    pub units: Vec<u32>,
    pub ratio: f64,
    pub raw_capacity: f64,
    pub capacity: f64,
    pub demand: f64,
    pub utilization: Option<f64>,
    pub reserved: bool,
    pub domains: Vec<DomainId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainSnapshot {
    pub uuid: DomainId,
    pub name: String,
    pub cpu_count: u32,
    pub memory_bytes: u64,
    pub cpu_ratio: f64,
    pub cpu_subset: Option<SubsetId>,
    pub memory_subset: Option<SubsetId>,
    pub cpu_pin: CpuPin,
}

/// Serializable view of the whole partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionSnapshot {
    pub subsets: Vec<SubsetSnapshot>,
    pub domains: Vec<DomainSnapshot>,
    pub free_cpus: Vec<u32>,
    pub free_memory_bytes: u64,
}

// =============================================================================
// Configuration
// =============================================================================

/// Ratio bounds and controller parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    pub cpu_default_ratio: f64,
    pub cpu_ratio_ceiling: f64,
    pub memory_default_ratio: f64,
    pub memory_ratio_ceiling: f64,
    pub policy: RatioPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            cpu_default_ratio: 1.0,
            cpu_ratio_ceiling: 2.0,
            memory_default_ratio: 1.0,
            memory_ratio_ceiling: 1.0,
            policy: RatioPolicy::default(),
        }
    }
}

impl ManagerConfig {
    pub fn default_ratio(&self, kind: ResourceKind) -> f64 {
        match kind {
            ResourceKind::Cpu => self.cpu_default_ratio,
            ResourceKind::Memory => self.memory_default_ratio,
        }
    }

    pub fn ceiling(&self, kind: ResourceKind) -> f64 {
        match kind {
            ResourceKind::Cpu => self.cpu_ratio_ceiling,
            ResourceKind::Memory => self.memory_ratio_ceiling,
        }
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Per-kind placement index.
#[derive(Debug, Clone, Default)]
struct KindIndex {
    placements: HashMap<DomainId, SubsetId>,
    allocated: BTreeSet<u32>,
}

/// Partition state restored when a multi-step mutation fails. Only undoes
/// placements; domains evicted after the checkpoint are not brought back.
pub(crate) struct Checkpoint {
    domains: BTreeSet<DomainId>,
    subsets: BTreeMap<SubsetId, Subset>,
    cpu: KindIndex,
    memory: KindIndex,
    next_id: u32,
}

/// Owns subsets, placed domains and the reverse indexes.
pub struct SubsetManager {
    topology: Arc<Topology>,
    config: ManagerConfig,
    subsets: BTreeMap<SubsetId, Subset>,
    domains: HashMap<DomainId, Domain>,
    cpu: KindIndex,
    memory: KindIndex,
    windows: HashMap<SubsetId, SmoothingWindow>,
    last_utilization: HashMap<SubsetId, f64>,
    next_id: u32,
}

impl SubsetManager {
    pub fn new(topology: Arc<Topology>, config: ManagerConfig) -> Self {
        Self {
            topology,
            config,
            subsets: BTreeMap::new(),
            domains: HashMap::new(),
            cpu: KindIndex::default(),
            memory: KindIndex::default(),
            windows: HashMap::new(),
            last_utilization: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    fn index(&self, kind: ResourceKind) -> &KindIndex {
        match kind {
            ResourceKind::Cpu => &self.cpu,
            ResourceKind::Memory => &self.memory,
        }
    }

    fn index_mut(&mut self, kind: ResourceKind) -> &mut KindIndex {
        match kind {
            ResourceKind::Cpu => &mut self.cpu,
            ResourceKind::Memory => &mut self.memory,
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn domain(&self, uuid: DomainId) -> Option<&Domain> {
        self.domains.get(&uuid)
    }

    pub fn domains(&self) -> impl Iterator<Item = &Domain> {
        self.domains.values()
    }

    pub fn subset(&self, id: SubsetId) -> Option<&Subset> {
        self.subsets.get(&id)
    }

    pub fn subsets(&self) -> impl Iterator<Item = &Subset> {
        self.subsets.values()
    }

    pub fn subset_of(&self, uuid: DomainId, kind: ResourceKind) -> Option<SubsetId> {
        self.index(kind).placements.get(&uuid).copied()
    }

    pub fn find_by_name(&self, name: &str) -> Option<DomainId> {
        self.domains
            .values()
            .find(|d| d.name() == name)
            .map(Domain::uuid)
    }

    /// Unallocated unit ids of a kind, ascending.
    pub fn free_units(&self, kind: ResourceKind) -> Vec<u32> {
        let allocated = &self.index(kind).allocated;
        self.topology
            .units(kind)
            .into_iter()
            .map(|u| u.id)
            .filter(|id| !allocated.contains(id))
            .collect()
    }

    // -------------------------------------------------------------------------
    // Placement
    // -------------------------------------------------------------------------

    /// Place a domain in a CPU subset and a memory subset.
    pub fn place(&mut self, domain: Domain) -> Result<Placement, PlacementError> {
        let uuid = domain.uuid();
        if self.domains.contains_key(&uuid) {
            return Err(PlacementError::AlreadyPlaced(uuid));
        }
        if self.find_by_name(domain.name()).is_some() {
            return Err(PlacementError::NameTaken(domain.name().to_string()));
        }

        let checkpoint = self.checkpoint();
        self.domains.insert(uuid, domain);

        let result = self.place_kind(uuid, ResourceKind::Cpu).and_then(|cpu_updates| {
            let memory_updates = self.place_kind(uuid, ResourceKind::Memory)?;
            Ok((cpu_updates, memory_updates))
        });

        match result {
            Ok((mut pin_updates, memory_updates)) => {
                pin_updates.extend(memory_updates);
                let placement = Placement {
                    uuid,
                    cpu_subset: self
                        .subset_of(uuid, ResourceKind::Cpu)
                        .ok_or(PlacementError::NotFound(uuid))?,
                    memory_subset: self
                        .subset_of(uuid, ResourceKind::Memory)
                        .ok_or(PlacementError::NotFound(uuid))?,
                    pin_updates,
                };
                info!(
                    uuid = %uuid,
                    cpu_subset = %placement.cpu_subset,
                    memory_subset = %placement.memory_subset,
                    "Placed domain"
                );
                Ok(placement)
            }
            Err(e) => {
                self.restore(checkpoint);
                debug!(uuid = %uuid, error = %e, "Placement rolled back");
                Err(e)
            }
        }
    }

    /// Place an already-registered domain for one resource kind.
    ///
    /// Returns the pin updates the placement caused; for CPU the placed
    /// domain's own pins come first.
    pub fn place_kind(
        &mut self,
        uuid: DomainId,
        kind: ResourceKind,
    ) -> Result<Vec<PinUpdate>, PlacementError> {
        if !self.domains.contains_key(&uuid) {
            return Err(PlacementError::NotFound(uuid));
        }
        if self.index(kind).placements.contains_key(&uuid) {
            return Err(PlacementError::AlreadyPlaced(uuid));
        }

        let mut repinned = Vec::new();
        let target = match self.find_admitting(uuid, kind) {
            Some(id) => id,
            None => match self.grow_for(uuid, kind)? {
                Some((id, moved)) => {
                    repinned = moved;
                    id
                }
                None => self
                    .carve_for(uuid, kind)?
                    .ok_or(PlacementError::NoCapacity { uuid, kind })?,
            },
        };

        let subset = self
            .subsets
            .get_mut(&target)
            .ok_or(PlacementError::SubsetNotFound(target))?;
        let domain = self
            .domains
            .get_mut(&uuid)
            .ok_or(PlacementError::NotFound(uuid))?;
        subset.add(domain)?;
        self.index_mut(kind).placements.insert(uuid, target);

        let mut updates = Vec::new();
        if kind == ResourceKind::Cpu {
            updates.push(self.pin_update(uuid));
            updates.extend(repinned.into_iter().map(|id| self.pin_update(id)));
        }
        Ok(updates)
    }

    fn pin_update(&self, uuid: DomainId) -> PinUpdate {
        PinUpdate {
            uuid,
            pins: self
                .domains
                .get(&uuid)
                .map(|d| d.cpu_pin().clone())
                .unwrap_or_default(),
        }
    }

    /// NUMA node of the domain's subset of the other kind, if placed.
    fn anchor_node(&self, uuid: DomainId, kind: ResourceKind) -> Option<u32> {
        self.subset_of(uuid, kind.other())
            .and_then(|id| self.subsets.get(&id))
            .map(Subset::numa_node)
    }

    fn node_distance(&self, anchor: Option<u32>, node: u32) -> u32 {
        anchor.map_or(0, |a| self.topology.distance(a, node))
    }

    /// Whether a domain may live in a subset regardless of its free room.
    fn compatible(&self, domain: &Domain, subset: &Subset) -> bool {
        match subset.kind() {
            ResourceKind::Cpu => subset.ratio() <= domain.cpu_ratio(),
            ResourceKind::Memory => true,
        }
    }

    fn find_admitting(&self, uuid: DomainId, kind: ResourceKind) -> Option<SubsetId> {
        let domain = self.domains.get(&uuid)?;
        let anchor = self.anchor_node(uuid, kind);
        let pinned = domain.pinned_cpus();

        self.subsets
            .values()
            .filter(|s| s.kind() == kind)
            .filter(|s| self.compatible(domain, s) && s.can_admit(domain))
            .filter(|s| kind != ResourceKind::Cpu || pinned.is_subset(s.units()))
            .min_by_key(|s| (self.node_distance(anchor, s.numa_node()), s.id()))
            .map(Subset::id)
    }

    /// Units needed for a subset of `ratio` to carry `demand`.
    fn units_needed(&self, kind: ResourceKind, demand: f64, ratio: f64) -> usize {
        let per_unit = self.topology.unit_quantity(kind) * ratio;
        ((demand / per_unit) - UNIT_EPSILON).ceil().max(1.0) as usize
    }

    /// Grow the least-loaded compatible subset with free units of its node.
    fn grow_for(
        &mut self,
        uuid: DomainId,
        kind: ResourceKind,
    ) -> Result<Option<(SubsetId, Vec<DomainId>)>, PlacementError> {
        let Some(domain) = self.domains.get(&uuid) else {
            return Err(PlacementError::NotFound(uuid));
        };
        let anchor = self.anchor_node(uuid, kind);
        let pinned = domain.pinned_cpus();
        let request = domain.request(kind);

        let mut candidates: Vec<&Subset> = self
            .subsets
            .values()
            .filter(|s| s.kind() == kind && self.compatible(domain, s))
            .collect();
        candidates.sort_by(|a, b| {
            let load_a = a.current_demand() / a.capacity();
            let load_b = b.current_demand() / b.capacity();
            load_a
                .total_cmp(&load_b)
                .then_with(|| {
                    self.node_distance(anchor, a.numa_node())
                        .cmp(&self.node_distance(anchor, b.numa_node()))
                })
                .then_with(|| a.id().cmp(&b.id()))
        });

        let free = self.free_units(kind);
        let mut plan = None;
        for subset in candidates {
            let needed = self.units_needed(kind, subset.current_demand() + request, subset.ratio());
            let Some(extra) = needed.checked_sub(subset.units().len()).filter(|n| *n > 0) else {
                continue;
            };

            let node_free: Vec<u32> = free
                .iter()
                .copied()
                .filter(|id| self.topology.unit_node(kind, *id) == Some(subset.numa_node()))
                .collect();
            let Some(annexed) = nearest_units(&node_free, subset.units(), extra) else {
                continue;
            };

            let mut units = subset.units().clone();
            units.extend(annexed);
            if kind == ResourceKind::Cpu && !pinned.is_subset(&units) {
                continue;
            }
            plan = Some((subset.id(), units));
            break;
        }

        let Some((id, units)) = plan else {
            return Ok(None);
        };
        let moved = self.apply_resize(id, units)?;
        info!(subset = %id, kind = %kind, "Grew subset");
        Ok(Some((id, moved)))
    }

    /// Carve a new subset. Floating domains get the front of the largest
    /// contiguous free run; pinned domains get their pinned CPUs plus the
    /// nearest free units of the same node, contiguous or not.
    fn carve_for(
        &mut self,
        uuid: DomainId,
        kind: ResourceKind,
    ) -> Result<Option<SubsetId>, PlacementError> {
        let Some(domain) = self.domains.get(&uuid) else {
            return Err(PlacementError::NotFound(uuid));
        };
        let pinned = if kind == ResourceKind::Cpu {
            domain.pinned_cpus()
        } else {
            BTreeSet::new()
        };

        let mut ratio = self.config.default_ratio(kind);
        if kind == ResourceKind::Cpu {
            ratio = ratio.min(domain.cpu_ratio());
        }
        let needed = self.units_needed(kind, domain.request(kind), ratio);

        let carved = if pinned.is_empty() {
            self.carve_floating(uuid, kind, needed)
        } else {
            self.carve_pinned(kind, &pinned, needed)
        };
        let Some((numa_node, units)) = carved else {
            return Ok(None);
        };

        let id = self.create_subset(kind, numa_node, units, ratio)?;
        Ok(Some(id))
    }

    fn carve_floating(
        &self,
        uuid: DomainId,
        kind: ResourceKind,
        needed: usize,
    ) -> Option<(u32, BTreeSet<u32>)> {
        let anchor = self.anchor_node(uuid, kind);
        let run = self.free_runs(kind).into_iter().min_by(|a, b| {
            b.units
                .len()
                .cmp(&a.units.len())
                .then_with(|| {
                    self.node_distance(anchor, a.numa_node)
                        .cmp(&self.node_distance(anchor, b.numa_node))
                })
                .then_with(|| a.units.first().cmp(&b.units.first()))
        })?;
        if run.units.len() < needed {
            return None;
        }
        Some((run.numa_node, run.units[..needed].iter().copied().collect()))
    }

    /// Every pinned CPU must be free and on one node.
    fn carve_pinned(
        &self,
        kind: ResourceKind,
        pinned: &BTreeSet<u32>,
        needed: usize,
    ) -> Option<(u32, BTreeSet<u32>)> {
        let free = self.free_units(kind);
        if !pinned.iter().all(|cpu| free.contains(cpu)) {
            return None;
        }
        let nodes: BTreeSet<u32> = pinned
            .iter()
            .filter_map(|cpu| self.topology.unit_node(kind, *cpu))
            .collect();
        let numa_node = match nodes.len() {
            1 => nodes.into_iter().next()?,
            _ => return None,
        };

        let rest: Vec<u32> = free
            .into_iter()
            .filter(|id| !pinned.contains(id))
            .filter(|id| self.topology.unit_node(kind, *id) == Some(numa_node))
            .collect();
        let extra = needed.saturating_sub(pinned.len());
        let annexed = nearest_units(&rest, pinned, extra)?;
        Some((numa_node, pinned.iter().copied().chain(annexed).collect()))
    }

    fn free_runs(&self, kind: ResourceKind) -> Vec<FreeRun> {
        let mut runs: Vec<FreeRun> = Vec::new();
        for id in self.free_units(kind) {
            let Some(node) = self.topology.unit_node(kind, id) else {
                continue;
            };
            match runs.last_mut() {
                Some(run)
                    if run.numa_node == node && run.units.last().is_some_and(|l| l + 1 == id) =>
                {
                    run.units.push(id);
                }
                _ => runs.push(FreeRun {
                    numa_node: node,
                    units: vec![id],
                }),
            }
        }
        runs
    }

    fn create_subset(
        &mut self,
        kind: ResourceKind,
        numa_node: u32,
        units: BTreeSet<u32>,
        ratio: f64,
    ) -> Result<SubsetId, PlacementError> {
        let id = SubsetId(self.next_id);
        let subset = Subset::new(
            id,
            kind,
            numa_node,
            units.clone(),
            self.topology.unit_quantity(kind),
            ratio,
        )?;
        self.next_id += 1;
        self.index_mut(kind).allocated.extend(units);
        self.subsets.insert(id, subset);
        info!(subset = %id, kind = %kind, numa_node, ratio, "Created subset");
        Ok(id)
    }

    fn apply_resize(
        &mut self,
        id: SubsetId,
        units: BTreeSet<u32>,
    ) -> Result<Vec<DomainId>, PlacementError> {
        let subset = self
            .subsets
            .get_mut(&id)
            .ok_or(PlacementError::SubsetNotFound(id))?;
        let kind = subset.kind();
        let old_units = subset.units().clone();
        let moved = subset.resize(units.clone(), &mut self.domains)?;

        let index = self.index_mut(kind);
        for unit in &old_units {
            index.allocated.remove(unit);
        }
        index.allocated.extend(units);
        Ok(moved)
    }

    // -------------------------------------------------------------------------
    // Eviction
    // -------------------------------------------------------------------------

    /// Remove a domain from the partition and return it.
    pub fn evict(&mut self, uuid: DomainId) -> Result<Domain, PlacementError> {
        let mut domain = self
            .domains
            .remove(&uuid)
            .ok_or(PlacementError::NotFound(uuid))?;

        for kind in ResourceKind::ALL {
            let Some(id) = self.index_mut(kind).placements.remove(&uuid) else {
                continue;
            };
            let Some(subset) = self.subsets.get_mut(&id) else {
                continue;
            };
            subset.remove(&mut domain);
            if subset.is_empty() && !subset.is_reserved() {
                self.release(id);
            }
        }

        info!(uuid = %uuid, name = %domain.name(), "Evicted domain");
        Ok(domain)
    }

    /// Return an empty subset's units to the free pool.
    fn release(&mut self, id: SubsetId) {
        let Some(subset) = self.subsets.remove(&id) else {
            return;
        };
        let index = self.index_mut(subset.kind());
        for unit in subset.units() {
            index.allocated.remove(unit);
        }
        self.windows.remove(&id);
        self.last_utilization.remove(&id);
        debug!(subset = %id, "Released subset");
    }

    // -------------------------------------------------------------------------
    // Sampling
    // -------------------------------------------------------------------------

    /// Store a fresh CPU-time sample; returns the utilization against the
    /// previous one (`None` when undefined).
    pub fn set_domain_time(
        &mut self,
        uuid: DomainId,
        sample: CpuTime,
    ) -> Result<Option<f64>, PlacementError> {
        let domain = self
            .domains
            .get_mut(&uuid)
            .ok_or(PlacementError::NotFound(uuid))?;
        Ok(domain
            .set_time(sample)
            .and_then(|prev| utilization_between(&prev, &sample)))
    }

    /// Forget a domain's sample (reported absent).
    pub fn clear_domain_time(&mut self, uuid: DomainId) -> Result<(), PlacementError> {
        self.domains
            .get_mut(&uuid)
            .ok_or(PlacementError::NotFound(uuid))?
            .clear_time();
        Ok(())
    }

    /// Snapshots of every subset, for loaders.
    pub fn subset_views(&self) -> Vec<SubsetView> {
        self.subsets
            .values()
            .map(|subset| SubsetView {
                id: subset.id(),
                kind: subset.kind(),
                numa_node: subset.numa_node(),
                raw_capacity: subset.raw_capacity(),
                ratio: subset.ratio(),
                domains: subset
                    .hosted()
                    .filter_map(|uuid| self.domains.get(&uuid))
                    .map(|d| DomainView {
                        uuid: d.uuid(),
                        name: d.name().to_string(),
                        request: d.request(subset.kind()),
                        last_time: d.time(),
                    })
                    .collect(),
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // Reconciliation
    // -------------------------------------------------------------------------

    /// Adjust ratios toward sustained load and release empty subsets.
    /// Domains are never moved.
    pub fn reconcile(&mut self, view: &UtilizationView) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let policy = self.config.policy.clone();

        let ids: Vec<SubsetId> = self.subsets.keys().copied().collect();
        for id in ids {
            let Some(subset) = self.subsets.get(&id) else {
                continue;
            };
            let kind = subset.kind();
            let Some(utilization) = subset
                .hosted()
                .map(|uuid| view.get(kind, uuid))
                .sum::<Option<f64>>()
            else {
                debug!(subset = %id, "Utilization undefined, holding ratio");
                self.last_utilization.remove(&id);
                report.held.push(id);
                continue;
            };
            let raw = subset.raw_capacity();
            let pressure = if raw > 0.0 { utilization / raw } else { 0.0 };

            let mut ceiling = self.config.ceiling(kind);
            if kind == ResourceKind::Cpu {
                ceiling = subset
                    .hosted()
                    .filter_map(|uuid| self.domains.get(&uuid))
                    .map(Domain::cpu_ratio)
                    .fold(ceiling, f64::min);
            }
            let floor = subset.ratio_floor();
            let current = subset.ratio();

            report.utilization.insert(id, utilization);
            self.last_utilization.insert(id, utilization);

            let window = self
                .windows
                .entry(id)
                .or_insert_with(|| policy.new_window());
            window.push(pressure);
            let decision = policy.decide(window, current, floor, ceiling);

            let Some(target) = decision.target() else {
                continue;
            };
            let mean_pressure = window.mean().unwrap_or(pressure);
            window.clear();

            let Some(subset) = self.subsets.get_mut(&id) else {
                continue;
            };
            match subset.set_oversubscription_ratio(target) {
                Ok(()) => {
                    info!(
                        subset = %id,
                        from = current,
                        to = target,
                        pressure = mean_pressure,
                        lowered = matches!(decision, RatioDecision::Lower(_)),
                        "Adjusted oversubscription ratio"
                    );
                    report.ratio_changes.push(RatioChange {
                        subset: id,
                        from: current,
                        to: target,
                    });
                }
                Err(e) => warn!(subset = %id, error = %e, "Ratio adjustment rejected"),
            }
        }

        let empty: Vec<SubsetId> = self
            .subsets
            .values()
            .filter(|s| s.is_empty() && !s.is_reserved())
            .map(Subset::id)
            .collect();
        for id in empty {
            self.release(id);
            report.released.push(id);
        }

        report
    }

    // -------------------------------------------------------------------------
    // Administration
    // -------------------------------------------------------------------------

    /// Override a subset's ratio.
    pub fn set_ratio(&mut self, id: SubsetId, ratio: f64) -> Result<(), PlacementError> {
        let subset = self
            .subsets
            .get_mut(&id)
            .ok_or(PlacementError::SubsetNotFound(id))?;
        subset.set_oversubscription_ratio(ratio)?;
        if let Some(window) = self.windows.get_mut(&id) {
            window.clear();
        }
        info!(subset = %id, ratio, "Set oversubscription ratio");
        Ok(())
    }

    /// Replace a subset's units. Units must exist on the subset's node and
    /// be free or already owned by it.
    pub fn resize_subset(
        &mut self,
        id: SubsetId,
        units: BTreeSet<u32>,
    ) -> Result<Vec<PinUpdate>, PlacementError> {
        let subset = self
            .subsets
            .get(&id)
            .ok_or(PlacementError::SubsetNotFound(id))?;
        let kind = subset.kind();
        let resize_error = |reason: String| {
            PlacementError::Subset(SubsetError::Resize { subset: id, reason })
        };

        for unit in &units {
            if self.topology.unit_node(kind, *unit) != Some(subset.numa_node()) {
                return Err(resize_error(format!(
                    "unit {unit} is not on node {}",
                    subset.numa_node()
                )));
            }
            if self.index(kind).allocated.contains(unit) && !subset.units().contains(unit) {
                return Err(resize_error(format!("unit {unit} belongs to another subset")));
            }
        }

        let moved = self.apply_resize(id, units)?;
        Ok(moved.into_iter().map(|uuid| self.pin_update(uuid)).collect())
    }

    /// Create an empty reserved subset that is never released.
    pub fn create_reserved(
        &mut self,
        kind: ResourceKind,
        units: BTreeSet<u32>,
    ) -> Result<SubsetId, PlacementError> {
        let first = units.first().copied().ok_or_else(|| {
            PlacementError::Subset(SubsetError::Resize {
                subset: SubsetId(self.next_id),
                reason: "a subset must own at least one unit".to_string(),
            })
        })?;
        let node = self.topology.unit_node(kind, first);
        let valid = units.iter().all(|u| {
            self.topology.unit_node(kind, *u) == node && !self.index(kind).allocated.contains(u)
        });
        let Some(node) = node.filter(|_| valid) else {
            return Err(PlacementError::Subset(SubsetError::Resize {
                subset: SubsetId(self.next_id),
                reason: "units must be free and on a single node".to_string(),
            }));
        };

        let id = self.create_subset(kind, node, units, self.config.default_ratio(kind))?;
        self.reserve(id)?;
        Ok(id)
    }

    /// Mark a subset as reserved.
    pub fn reserve(&mut self, id: SubsetId) -> Result<(), PlacementError> {
        self.subsets
            .get_mut(&id)
            .ok_or(PlacementError::SubsetNotFound(id))?
            .set_reserved(true);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    pub fn describe(&self) -> PartitionSnapshot {
        let subsets = self
            .subsets
            .values()
            .map(|s| SubsetSnapshot {
                id: s.id(),
                kind: s.kind(),
                numa_node: s.numa_node(),
                units: s.units().iter().copied().collect(),
                ratio: s.ratio(),
                raw_capacity: s.raw_capacity(),
                capacity: s.capacity(),
                demand: s.current_demand(),
                utilization: self.last_utilization.get(&s.id()).copied(),
                reserved: s.is_reserved(),
                domains: s.hosted().collect(),
            })
            .collect();

        let mut domains: Vec<DomainSnapshot> = self
            .domains
            .values()
            .map(|d| DomainSnapshot {
                uuid: d.uuid(),
                name: d.name().to_string(),
                cpu_count: d.cpu_count(),
                memory_bytes: d.memory_bytes(),
                cpu_ratio: d.cpu_ratio(),
                cpu_subset: self.subset_of(d.uuid(), ResourceKind::Cpu),
                memory_subset: self.subset_of(d.uuid(), ResourceKind::Memory),
                cpu_pin: d.cpu_pin().clone(),
            })
            .collect();
        domains.sort_by(|a, b| a.name.cmp(&b.name));

        PartitionSnapshot {
            subsets,
            domains,
            free_cpus: self.free_units(ResourceKind::Cpu),
            free_memory_bytes: self.free_units(ResourceKind::Memory).len() as u64
                * self.topology.memory_granule_bytes(),
        }
    }

    /// Verify the partition invariants.
    pub fn check_invariants(&self) -> Result<(), String> {
        for kind in ResourceKind::ALL {
            let mut seen = BTreeSet::new();
            for subset in self.subsets.values().filter(|s| s.kind() == kind) {
                for unit in subset.units() {
                    if !seen.insert(*unit) {
                        return Err(format!("{kind} unit {unit} owned by two subsets"));
                    }
                }
                if subset.current_demand() > subset.capacity() + UNIT_EPSILON {
                    return Err(format!(
                        "{} demand {} exceeds capacity {}",
                        subset.id(),
                        subset.current_demand(),
                        subset.capacity()
                    ));
                }
                for uuid in subset.hosted() {
                    if self.subset_of(uuid, kind) != Some(subset.id()) {
                        return Err(format!("{uuid} hosted by {} but not indexed", subset.id()));
                    }
                }
            }
            if seen != self.index(kind).allocated {
                return Err(format!("{kind} allocation set out of sync"));
            }

            for (uuid, id) in &self.index(kind).placements {
                let hosted = self.subsets.get(id).is_some_and(|s| s.hosts(*uuid));
                if !hosted {
                    return Err(format!("{uuid} indexed in {id} but not hosted"));
                }
            }
        }

        for (uuid, domain) in &self.domains {
            for kind in ResourceKind::ALL {
                if self.subset_of(*uuid, kind).is_none() {
                    return Err(format!("{uuid} has no {kind} subset"));
                }
            }

            let Some(cpus) = self
                .subset_of(*uuid, ResourceKind::Cpu)
                .and_then(|id| self.subsets.get(&id))
                .map(Subset::units)
            else {
                continue;
            };
            let stray = domain
                .get_cpu_pin_aggregated(&self.topology)
                .into_iter()
                .find(|(cpu, pinned)| *pinned && !cpus.contains(cpu));
            if let Some((cpu, _)) = stray {
                return Err(format!("{uuid} pinned to CPU {cpu} outside its subset"));
            }
        }
        Ok(())
    }

    pub(crate) fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            domains: self.domains.keys().copied().collect(),
            subsets: self.subsets.clone(),
            cpu: self.cpu.clone(),
            memory: self.memory.clone(),
            next_id: self.next_id,
        }
    }

    /// Roll back to a checkpoint, restoring pins changed by growth.
    pub(crate) fn restore(&mut self, checkpoint: Checkpoint) {
        for (id, old) in &checkpoint.subsets {
            let changed = self.subsets.get(id).is_some_and(|s| s.units() != old.units());
            if !changed || old.kind() != ResourceKind::Cpu {
                continue;
            }
            for uuid in old.hosted() {
                if let Some(domain) = self.domains.get_mut(&uuid) {
                    let pinned_to_new = self
                        .subsets
                        .get(id)
                        .is_some_and(|s| domain.pinned_cpus() == *s.units());
                    if pinned_to_new {
                        domain.pin_all(old.units());
                    }
                }
            }
        }
        self.domains
            .retain(|uuid, _| checkpoint.domains.contains(uuid));
        self.subsets = checkpoint.subsets;
        self.cpu = checkpoint.cpu;
        self.memory = checkpoint.memory;
        self.next_id = checkpoint.next_id;
        let live: BTreeSet<SubsetId> = self.subsets.keys().copied().collect();
        self.windows.retain(|id, _| live.contains(id));
        self.last_utilization.retain(|id, _| live.contains(id));
    }
}

struct FreeRun {
    numa_node: u32,
    units: Vec<u32>,
}

/// Pick `count` units from `free`, closest (by id) to `owned` first.
fn nearest_units(free: &[u32], owned: &BTreeSet<u32>, count: usize) -> Option<Vec<u32>> {
    if free.len() < count {
        return None;
    }
    let gap = |id: u32| {
        owned
            .iter()
            .map(|o| o.abs_diff(id))
            .min()
            .unwrap_or(u32::MAX)
    };
    let mut ordered = free.to_vec();
    ordered.sort_by_key(|id| (gap(*id), *id));
    ordered.truncate(count);
    Some(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::tests::spec;
    use crate::topology::tests::two_node_raw;
    use crate::topology::{CpuInfo, MemoryNode, RawTopology};

    const GIB: u64 = 1024 * 1024 * 1024;

    fn one_node(cpus: u32) -> Arc<Topology> {
        let raw = RawTopology {
            cpus: (0..cpus)
                .map(|cpu_id| CpuInfo {
                    cpu_id,
                    numa_node: 0,
                    core_id: cpu_id,
                })
                .collect(),
            memory: vec![MemoryNode {
                numa_node: 0,
                capacity_bytes: 16 * GIB,
            }],
            distances: vec![vec![0]],
        };
        Arc::new(Topology::build(raw).unwrap())
    }

    fn vm(name: &str, cpus: u32, ratio: f64) -> Domain {
        Domain::new(spec(name, cpus, 512, ratio)).unwrap()
    }

    #[test]
    fn test_first_placement_carves_subset() {
        let mut manager = SubsetManager::new(one_node(4), ManagerConfig::default());
        let placement = manager.place(vm("d1", 2, 1.0)).unwrap();

        let subset = manager.subset(placement.cpu_subset).unwrap();
        assert_eq!(subset.units(), &BTreeSet::from([0, 1]));
        assert_eq!(placement.pin_updates[0].pins, vec![BTreeSet::from([0, 1]); 2]);
        assert_eq!(manager.free_units(ResourceKind::Cpu), vec![2, 3]);
        manager.check_invariants().unwrap();
    }

    #[test]
    fn test_invariants_catch_stray_pins() {
        let mut manager = SubsetManager::new(one_node(4), ManagerConfig::default());
        let placement = manager.place(vm("d1", 2, 1.0)).unwrap();
        manager
            .domains
            .get_mut(&placement.uuid)
            .unwrap()
            .pin_all(&BTreeSet::from([3]));

        let violation = manager.check_invariants().unwrap_err();
        assert!(violation.contains("CPU 3"), "{violation}");
    }

    #[test]
    fn test_carve_from_scattered_pins() {
        let mut manager = SubsetManager::new(one_node(4), ManagerConfig::default());
        let mut blocker = spec("blocker", 1, 512, 2.0);
        blocker.cpu_pin = Some(vec![BTreeSet::from([2])]);
        let blocker = manager.place(Domain::new(blocker).unwrap()).unwrap();
        // Neither admits nor grows for a domain capped at 1.0.
        manager.set_ratio(blocker.cpu_subset, 1.5).unwrap();

        let mut scattered = spec("scattered", 2, 512, 1.0);
        scattered.cpu_pin = Some(vec![BTreeSet::from([1]), BTreeSet::from([3])]);
        let placement = manager.place(Domain::new(scattered).unwrap()).unwrap();

        let subset = manager.subset(placement.cpu_subset).unwrap();
        assert_eq!(subset.units(), &BTreeSet::from([1, 3]));
        assert_eq!(manager.free_units(ResourceKind::Cpu), vec![0]);
        manager.check_invariants().unwrap();

        // A pinned CPU that is already taken cannot be carved.
        let mut taken = spec("taken", 1, 512, 1.0);
        taken.cpu_pin = Some(vec![BTreeSet::from([2])]);
        let err = manager.place(Domain::new(taken).unwrap()).unwrap_err();
        assert_eq!(err.reason_code(), "no_capacity");
    }

    #[test]
    fn test_growth_repins_existing_domains() {
        let mut manager = SubsetManager::new(one_node(4), ManagerConfig::default());
        let first = manager.place(vm("d1", 2, 1.0)).unwrap();
        let second = manager.place(vm("d2", 2, 1.0)).unwrap();

        assert_eq!(first.cpu_subset, second.cpu_subset);
        assert_eq!(second.pin_updates.len(), 2);
        assert_eq!(second.pin_updates[1].uuid, first.uuid);
        assert_eq!(
            manager.domain(first.uuid).unwrap().pinned_cpus(),
            BTreeSet::from([0, 1, 2, 3])
        );
        manager.check_invariants().unwrap();
    }

    #[test]
    fn test_no_capacity_leaves_partition_unchanged() {
        let mut manager = SubsetManager::new(one_node(4), ManagerConfig::default());
        manager.place(vm("d1", 2, 1.0)).unwrap();
        manager.place(vm("d2", 2, 1.0)).unwrap();
        let before = manager.describe();

        let err = manager.place(vm("d3", 2, 1.0)).unwrap_err();
        assert_eq!(err.reason_code(), "no_capacity");
        assert_eq!(manager.describe(), before);
    }

    #[test]
    fn test_memory_failure_rolls_back_cpu() {
        let mut manager = SubsetManager::new(one_node(4), ManagerConfig::default());
        let huge = Domain::new(spec("big", 1, 64 * 1024, 1.0)).unwrap();

        assert!(matches!(
            manager.place(huge),
            Err(PlacementError::NoCapacity {
                kind: ResourceKind::Memory,
                ..
            })
        ));
        assert_eq!(manager.subsets().count(), 0);
        assert_eq!(manager.free_units(ResourceKind::Cpu).len(), 4);
    }

    #[test]
    fn test_duplicate_placement_rejected() {
        let mut manager = SubsetManager::new(one_node(4), ManagerConfig::default());
        let d = vm("d1", 1, 1.0);
        let copy = d.clone();
        manager.place(d).unwrap();

        assert!(matches!(
            manager.place(copy),
            Err(PlacementError::AlreadyPlaced(_))
        ));
        assert!(matches!(
            manager.place(vm("d1", 1, 1.0)),
            Err(PlacementError::NameTaken(_))
        ));
    }

    #[test]
    fn test_subset_ratio_above_domain_ratio_not_used() {
        let mut manager = SubsetManager::new(one_node(4), ManagerConfig::default());
        let placed = manager.place(vm("d1", 2, 2.0)).unwrap();
        manager.set_ratio(placed.cpu_subset, 2.0).unwrap();

        let strict = manager.place(vm("d2", 1, 1.0)).unwrap();
        assert_ne!(strict.cpu_subset, placed.cpu_subset);
        manager.check_invariants().unwrap();
    }

    #[test]
    fn test_memory_prefers_cpu_node() {
        let topology = Arc::new(Topology::build(two_node_raw(2)).unwrap());
        let mut manager = SubsetManager::new(topology, ManagerConfig::default());
        let mut s = spec("pinned", 1, 512, 1.0);
        s.cpu_pin = Some(vec![BTreeSet::from([3])]);

        let placement = manager.place(Domain::new(s).unwrap()).unwrap();
        assert_eq!(manager.subset(placement.cpu_subset).unwrap().numa_node(), 1);
        assert_eq!(manager.subset(placement.memory_subset).unwrap().numa_node(), 1);
        assert_eq!(
            manager.domain(placement.uuid).unwrap().pinned_cpus(),
            BTreeSet::from([3])
        );
    }

    #[test]
    fn test_evict_releases_empty_subsets() {
        let mut manager = SubsetManager::new(one_node(4), ManagerConfig::default());
        let placement = manager.place(vm("d1", 2, 1.0)).unwrap();

        let domain = manager.evict(placement.uuid).unwrap();
        assert!(!domain.is_pinned());
        assert_eq!(manager.subsets().count(), 0);
        assert_eq!(manager.free_units(ResourceKind::Cpu).len(), 4);
        assert!(matches!(
            manager.evict(placement.uuid),
            Err(PlacementError::NotFound(_))
        ));
    }

    #[test]
    fn test_reserved_subset_survives_eviction() {
        let mut manager = SubsetManager::new(one_node(4), ManagerConfig::default());
        let reserved = manager
            .create_reserved(ResourceKind::Cpu, BTreeSet::from([0, 1]))
            .unwrap();
        let placement = manager.place(vm("d1", 2, 1.0)).unwrap();
        assert_eq!(placement.cpu_subset, reserved);

        manager.evict(placement.uuid).unwrap();
        assert!(manager.subset(reserved).is_some());

        manager.reconcile(&UtilizationView::new());
        assert!(manager.subset(reserved).is_some());
    }

    #[test]
    fn test_set_domain_time_derives_utilization() {
        let mut manager = SubsetManager::new(one_node(4), ManagerConfig::default());
        let uuid = manager.place(vm("d1", 2, 1.0)).unwrap().uuid;
        let at = |epoch_ns, total_ns| CpuTime {
            epoch_ns,
            total_ns,
            system_ns: 0,
            user_ns: total_ns,
        };

        assert_eq!(manager.set_domain_time(uuid, at(1_000, 0)).unwrap(), None);
        assert_eq!(
            manager.set_domain_time(uuid, at(2_000, 500)).unwrap(),
            Some(0.5)
        );
        manager.clear_domain_time(uuid).unwrap();
        assert!(manager.domain(uuid).unwrap().time().is_none());
    }

    fn idle(uuid: DomainId) -> UtilizationView {
        let mut view = UtilizationView::new();
        view.insert(ResourceKind::Cpu, uuid, 0.0);
        view.insert(ResourceKind::Memory, uuid, 0.0);
        view
    }

    #[test]
    fn test_reconcile_raises_after_sustained_idle() {
        let mut manager = SubsetManager::new(one_node(4), ManagerConfig::default());
        let placement = manager.place(vm("d1", 2, 2.0)).unwrap();
        let view = idle(placement.uuid);

        for _ in 0..4 {
            assert!(manager.reconcile(&view).ratio_changes.is_empty());
        }
        let report = manager.reconcile(&view);
        // Memory stays at its 1.0 ceiling.
        assert_eq!(report.ratio_changes.len(), 1);
        assert_eq!(report.ratio_changes[0].subset, placement.cpu_subset);
        assert_eq!(manager.subset(placement.cpu_subset).unwrap().ratio(), 1.1);
    }

    #[test]
    fn test_reconcile_raise_capped_by_domain_ratio() {
        let mut manager = SubsetManager::new(one_node(4), ManagerConfig::default());
        let placement = manager.place(vm("d1", 2, 1.0)).unwrap();

        for _ in 0..10 {
            manager.reconcile(&idle(placement.uuid));
        }
        assert_eq!(manager.subset(placement.cpu_subset).unwrap().ratio(), 1.0);
    }

    #[test]
    fn test_reconcile_holds_without_readings() {
        let mut manager = SubsetManager::new(one_node(4), ManagerConfig::default());
        let placement = manager.place(vm("d1", 2, 2.0)).unwrap();

        for _ in 0..4 {
            manager.reconcile(&idle(placement.uuid));
        }
        // One more idle tick would raise; a tick without readings must not.
        let report = manager.reconcile(&UtilizationView::new());
        assert!(report.ratio_changes.is_empty());
        assert!(report.held.contains(&placement.cpu_subset));
        assert!(!report.utilization.contains_key(&placement.cpu_subset));
        assert_eq!(manager.subset(placement.cpu_subset).unwrap().ratio(), 1.0);

        let snapshot = manager.describe();
        let cpu = snapshot
            .subsets
            .iter()
            .find(|s| s.id == placement.cpu_subset)
            .unwrap();
        assert_eq!(cpu.utilization, None);

        let report = manager.reconcile(&idle(placement.uuid));
        assert_eq!(report.ratio_changes.len(), 1);
    }

    #[test]
    fn test_reconcile_never_lowers_below_floor() {
        let mut manager = SubsetManager::new(one_node(4), ManagerConfig::default());
        let mut uuids = Vec::new();
        uuids.push(manager.place(vm("d1", 2, 2.0)).unwrap());
        uuids.push(manager.place(vm("d2", 2, 2.0)).unwrap());
        let subset = uuids[0].cpu_subset;
        manager.set_ratio(subset, 1.5).unwrap();
        uuids.push(manager.place(vm("d3", 2, 2.0)).unwrap());

        let mut view = UtilizationView::new();
        for p in &uuids {
            view.insert(ResourceKind::Cpu, p.uuid, 2.0);
        }
        for _ in 0..10 {
            manager.reconcile(&view);
        }

        let subset = manager.subset(subset).unwrap();
        assert_eq!(subset.ratio(), 1.5);
        assert_eq!(subset.ratio_floor(), 1.5);
        manager.check_invariants().unwrap();
    }

    #[test]
    fn test_resize_subset_validates_units() {
        let topology = Arc::new(Topology::build(two_node_raw(4)).unwrap());
        let mut manager = SubsetManager::new(topology, ManagerConfig::default());
        let placement = manager.place(vm("d1", 2, 1.0)).unwrap();
        let id = placement.cpu_subset;

        assert!(manager
            .resize_subset(id, BTreeSet::from([0, 1, 4]))
            .is_err());

        let updates = manager.resize_subset(id, BTreeSet::from([0, 1, 2])).unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].pins, vec![BTreeSet::from([0, 1, 2]); 2]);
        manager.check_invariants().unwrap();
    }

    #[test]
    fn test_describe_reports_free_resources() {
        let mut manager = SubsetManager::new(one_node(4), ManagerConfig::default());
        manager.place(vm("d1", 1, 1.0)).unwrap();

        let snapshot = manager.describe();
        assert_eq!(snapshot.subsets.len(), 2);
        assert_eq!(snapshot.domains[0].name, "d1");
        assert_eq!(snapshot.free_cpus, vec![1, 2, 3]);
        assert_eq!(snapshot.free_memory_bytes, 16 * GIB - 512 * 1024 * 1024);
    }

    #[test]
    fn test_nearest_units() {
        let owned = BTreeSet::from([4, 5]);
        assert_eq!(nearest_units(&[0, 1, 6, 7], &owned, 2), Some(vec![6, 7]));
        assert_eq!(nearest_units(&[0, 1], &owned, 3), None);
    }
}
