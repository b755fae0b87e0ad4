//! Domain (virtual machine) entity.
//!
//! A `Domain` carries the configured resources of one VM, its current CPU
//! pinning and the latest CPU-time sample read from the hypervisor.
//! Utilization is never stored; it is derived from two consecutive samples.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::topology::{ResourceKind, Topology};

/// Errors raised when a domain description is malformed.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("invalid domain uuid: {0}")]
    InvalidUuid(String),
}

// =============================================================================
// Identity
// =============================================================================

/// Globally unique domain identifier (the hypervisor uuid).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomainId(Uuid);

impl DomainId {
    /// Generate a fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for DomainId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for DomainId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| ValidationError::InvalidUuid(e.to_string()))
    }
}

// =============================================================================
// Samples and pins
// =============================================================================

/// Per-vCPU pinning: entry `i` is the set of physical CPUs vCPU `i` may
/// run on. An empty set means the vCPU floats.
pub type CpuPin = Vec<BTreeSet<u32>>;

/// Cumulative CPU-time counters captured at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuTime {
    pub epoch_ns: u64,
    pub total_ns: u64,
    pub system_ns: u64,
    pub user_ns: u64,
}

/// Utilization (in cores) between two samples, or `None` when undefined.
pub fn utilization_between(prev: &CpuTime, next: &CpuTime) -> Option<f64> {
    if next.epoch_ns <= prev.epoch_ns || next.total_ns < prev.total_ns {
        return None;
    }
    let delta_total = (next.total_ns - prev.total_ns) as f64;
    let delta_epoch = (next.epoch_ns - prev.epoch_ns) as f64;
    Some(delta_total / delta_epoch)
}

// =============================================================================
// Requests
// =============================================================================

/// Largest vCPU count a domain may request. Checked before any per-vCPU
/// state is allocated.
pub const MAX_CPU_COUNT: u32 = 1024;

/// Unvalidated domain description, as received from the command API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainSpec {
    #[serde(default)]
    pub uuid: Option<DomainId>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub memory_bytes: Option<u64>,
    #[serde(default)]
    pub cpu_count: Option<u32>,
    #[serde(default)]
    pub cpu_pin: Option<CpuPin>,
    #[serde(default)]
    pub cpu_ratio: Option<f64>,
}

impl DomainSpec {
    /// Fill in the fields the command layer may generate: a fresh uuid and
    /// an unpinned vCPU layout.
    pub fn with_generated_fields(mut self) -> Self {
        self.uuid.get_or_insert_with(DomainId::new);
        self.cpu_pin.get_or_insert_with(Vec::new);
        self
    }
}

// =============================================================================
// Domain
// =============================================================================

/// A virtual machine under scheduling.
#[derive(Debug, Clone, PartialEq)]
pub struct Domain {
    uuid: DomainId,
    name: String,
    memory_bytes: u64,
    cpu_count: u32,
    cpu_ratio: f64,
    cpu_pin: CpuPin,
    time: Option<CpuTime>,
}

impl Domain {
    /// Validate a spec and build the domain.
    pub fn new(spec: DomainSpec) -> Result<Self, ValidationError> {
        let uuid = spec.uuid.ok_or(ValidationError::MissingField("uuid"))?;
        let name = spec.name.ok_or(ValidationError::MissingField("name"))?;
        let memory_bytes = spec
            .memory_bytes
            .ok_or(ValidationError::MissingField("memory_bytes"))?;
        let cpu_count = spec
            .cpu_count
            .ok_or(ValidationError::MissingField("cpu_count"))?;
        let cpu_pin = spec
            .cpu_pin
            .ok_or(ValidationError::MissingField("cpu_pin"))?;
        let cpu_ratio = spec
            .cpu_ratio
            .ok_or(ValidationError::MissingField("cpu_ratio"))?;

        if name.trim().is_empty() {
            return Err(ValidationError::InvalidValue {
                field: "name",
                reason: "must not be empty".to_string(),
            });
        }
        if cpu_count == 0 || cpu_count > MAX_CPU_COUNT {
            return Err(ValidationError::InvalidValue {
                field: "cpu_count",
                reason: format!("must be within 1..={MAX_CPU_COUNT}, got {cpu_count}"),
            });
        }
        if memory_bytes == 0 {
            return Err(ValidationError::InvalidValue {
                field: "memory_bytes",
                reason: "must be positive".to_string(),
            });
        }
        if !cpu_ratio.is_finite() || cpu_ratio < 1.0 {
            return Err(ValidationError::InvalidValue {
                field: "cpu_ratio",
                reason: format!("must be >= 1.0, got {cpu_ratio}"),
            });
        }

        let cpu_pin = if cpu_pin.is_empty() {
            vec![BTreeSet::new(); cpu_count as usize]
        } else if cpu_pin.len() == cpu_count as usize {
            cpu_pin
        } else {
            return Err(ValidationError::InvalidValue {
                field: "cpu_pin",
                reason: format!(
                    "expected {cpu_count} vCPU entries, got {}",
                    cpu_pin.len()
                ),
            });
        };

        Ok(Self {
            uuid,
            name,
            memory_bytes,
            cpu_count,
            cpu_ratio,
            cpu_pin,
            time: None,
        })
    }

    pub fn uuid(&self) -> DomainId {
        self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory_bytes
    }

    pub fn cpu_count(&self) -> u32 {
        self.cpu_count
    }

    pub fn cpu_ratio(&self) -> f64 {
        self.cpu_ratio
    }

    pub fn cpu_pin(&self) -> &CpuPin {
        &self.cpu_pin
    }

    /// Configured demand for a resource kind (vCPUs or bytes).
    pub fn request(&self, kind: ResourceKind) -> f64 {
        match kind {
            ResourceKind::Cpu => f64::from(self.cpu_count),
            ResourceKind::Memory => self.memory_bytes as f64,
        }
    }

    /// True if at least one vCPU is restricted to specific CPUs.
    pub fn is_pinned(&self) -> bool {
        self.cpu_pin.iter().any(|cpus| !cpus.is_empty())
    }

    /// Union of the physical CPUs referenced by any vCPU.
    pub fn pinned_cpus(&self) -> BTreeSet<u32> {
        self.cpu_pin.iter().flatten().copied().collect()
    }

    /// For every physical CPU of the topology, whether at least one vCPU of
    /// this domain is pinned there.
    pub fn get_cpu_pin_aggregated(&self, topology: &Topology) -> BTreeMap<u32, bool> {
        let pinned = self.pinned_cpus();
        topology
            .cpus()
            .map(|cpu| (cpu.cpu_id, pinned.contains(&cpu.cpu_id)))
            .collect()
    }

    /// Pin every vCPU to `cpus`.
    pub(crate) fn pin_all(&mut self, cpus: &BTreeSet<u32>) {
        for vcpu in &mut self.cpu_pin {
            vcpu.clone_from(cpus);
        }
    }

    /// Return every vCPU to floating.
    pub(crate) fn clear_cpu_pin(&mut self) {
        for vcpu in &mut self.cpu_pin {
            vcpu.clear();
        }
    }

    /// Overwrite the stored sample, returning the one it replaces.
    pub fn set_time(&mut self, sample: CpuTime) -> Option<CpuTime> {
        self.time.replace(sample)
    }

    /// Forget the stored sample (domain reported stopped).
    pub fn clear_time(&mut self) {
        self.time = None;
    }

    pub fn time(&self) -> Option<CpuTime> {
        self.time
    }

    /// Rebuild the spec this domain was created from (current pins included).
    pub fn to_spec(&self) -> DomainSpec {
        DomainSpec {
            uuid: Some(self.uuid),
            name: Some(self.name.clone()),
            memory_bytes: Some(self.memory_bytes),
            cpu_count: Some(self.cpu_count),
            cpu_pin: Some(self.cpu_pin.clone()),
            cpu_ratio: Some(self.cpu_ratio),
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "vm {} {}vCPU {}MB with oc {}",
            self.name,
            self.cpu_count,
            self.memory_bytes / (1024 * 1024),
            self.cpu_ratio
        )
    }
}
