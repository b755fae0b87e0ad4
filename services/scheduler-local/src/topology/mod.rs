//! Physical topology model.
//!
//! A `Topology` describes the CPUs (grouped by NUMA node), the memory of
//! each NUMA node and the distances between nodes. It is built once at
//! startup, either from a JSON description or by exploring the host, and
//! is read-only afterwards.
//!
//! Both resource kinds are exposed as *units* so that subsets of either
//! kind can own a plain set of unit ids:
//!
//! - CPU unit `n` is physical CPU `n`, worth one vCPU.
//! - Memory unit `n` is the n-th fixed-size granule, numbered node after node.

mod explorer;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use explorer::{explore, explore_from};

/// Default size of one allocatable memory granule (256 MiB).
pub const DEFAULT_MEMORY_GRANULE_BYTES: u64 = 256 * 1024 * 1024;

// =============================================================================
// Errors
// =============================================================================

/// Errors raised while building a topology.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopologyError {
    #[error("topology has no CPUs")]
    NoCpus,

    #[error("duplicate cpu id {0}")]
    DuplicateCpu(u32),

    #[error("duplicate memory node {0}")]
    DuplicateNode(u32),

    #[error("cpu {cpu_id} references unknown NUMA node {numa_node}")]
    UnknownNode { cpu_id: u32, numa_node: u32 },

    #[error("distance matrix must be {expected}x{expected}")]
    DistanceShape { expected: usize },

    #[error("distance matrix is not symmetric at ({row}, {col})")]
    AsymmetricDistance { row: usize, col: usize },

    #[error("distance matrix diagonal is not zero at index {0}")]
    NonZeroDiagonal(usize),

    #[error("memory granule size must be non-zero")]
    InvalidGranule,

    #[error("failed to parse topology: {0}")]
    Parse(String),

    #[error("failed to explore host topology: {0}")]
    Explore(String),
}

// =============================================================================
// Raw description
// =============================================================================

/// Resource kind managed by subsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Cpu,
    Memory,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 2] = [ResourceKind::Cpu, ResourceKind::Memory];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cpu" => Some(Self::Cpu),
            "memory" | "mem" => Some(Self::Memory),
            _ => None,
        }
    }

    /// The kind a domain is co-located with.
    pub fn other(&self) -> Self {
        match self {
            Self::Cpu => Self::Memory,
            Self::Memory => Self::Cpu,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One physical CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuInfo {
    pub cpu_id: u32,
    pub numa_node: u32,
    pub core_id: u32,
}

/// Memory attached to one NUMA node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryNode {
    pub numa_node: u32,
    pub capacity_bytes: u64,
}

/// Unvalidated topology description, as read from JSON or the host.
///
/// `distances[i][j]` is indexed by the position of the memory nodes once
/// sorted by node id. An empty matrix means "all remote nodes equidistant".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTopology {
    pub cpus: Vec<CpuInfo>,
    pub memory: Vec<MemoryNode>,
    #[serde(default)]
    pub distances: Vec<Vec<u32>>,
}

impl RawTopology {
    /// Parse a JSON topology description.
    pub fn from_json(json: &str) -> Result<Self, TopologyError> {
        serde_json::from_str(json).map_err(|e| TopologyError::Parse(e.to_string()))
    }

    /// Serialize to pretty JSON (debug dumps).
    pub fn to_json(&self) -> Result<String, TopologyError> {
        serde_json::to_string_pretty(self).map_err(|e| TopologyError::Parse(e.to_string()))
    }

    /// Drop CPUs that must never be handed to guests.
    pub fn exclude_cpus(&mut self, excluded: &[u32]) {
        self.cpus.retain(|cpu| !excluded.contains(&cpu.cpu_id));
    }
}

// =============================================================================
// Topology
// =============================================================================

/// An allocatable unit of a resource kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unit {
    pub id: u32,
    pub numa_node: u32,
}

/// Immutable, validated physical topology.
#[derive(Debug, Clone)]
pub struct Topology {
    cpus: BTreeMap<u32, CpuInfo>,
    memory: Vec<MemoryNode>,
    node_index: BTreeMap<u32, usize>,
    distances: Vec<Vec<u32>>,
    memory_granule_bytes: u64,
    granule_nodes: Vec<u32>,
}

impl Topology {
    /// Build a topology with the default memory granule.
    pub fn build(raw: RawTopology) -> Result<Self, TopologyError> {
        Self::build_with_granule(raw, DEFAULT_MEMORY_GRANULE_BYTES)
    }

    /// Validate a raw description and build the topology.
    pub fn build_with_granule(
        raw: RawTopology,
        memory_granule_bytes: u64,
    ) -> Result<Self, TopologyError> {
        if memory_granule_bytes == 0 {
            return Err(TopologyError::InvalidGranule);
        }
        if raw.cpus.is_empty() {
            return Err(TopologyError::NoCpus);
        }

        let mut memory = raw.memory;
        memory.sort_by_key(|m| m.numa_node);

        let mut node_index = BTreeMap::new();
        for (index, node) in memory.iter().enumerate() {
            if node_index.insert(node.numa_node, index).is_some() {
                return Err(TopologyError::DuplicateNode(node.numa_node));
            }
        }

        let mut cpus = BTreeMap::new();
        for cpu in raw.cpus {
            if !node_index.contains_key(&cpu.numa_node) {
                return Err(TopologyError::UnknownNode {
                    cpu_id: cpu.cpu_id,
                    numa_node: cpu.numa_node,
                });
            }
            if cpus.insert(cpu.cpu_id, cpu).is_some() {
                return Err(TopologyError::DuplicateCpu(cpu.cpu_id));
            }
        }

        let distances = if raw.distances.is_empty() {
            default_distances(memory.len())
        } else {
            validate_distances(raw.distances, memory.len())?
        };

        let granule_nodes = memory
            .iter()
            .flat_map(|node| {
                let count = node.capacity_bytes / memory_granule_bytes;
                std::iter::repeat_n(node.numa_node, count as usize)
            })
            .collect();

        Ok(Self {
            cpus,
            memory,
            node_index,
            distances,
            memory_granule_bytes,
            granule_nodes,
        })
    }

    /// NUMA node ids, ascending.
    pub fn nodes(&self) -> impl Iterator<Item = u32> + '_ {
        self.memory.iter().map(|m| m.numa_node)
    }

    /// All CPUs, ordered by id.
    pub fn cpus(&self) -> impl Iterator<Item = &CpuInfo> {
        self.cpus.values()
    }

    /// CPU ids belonging to a node.
    pub fn cpus_of(&self, numa_node: u32) -> BTreeSet<u32> {
        self.cpus
            .values()
            .filter(|c| c.numa_node == numa_node)
            .map(|c| c.cpu_id)
            .collect()
    }

    pub fn numa_of_cpu(&self, cpu_id: u32) -> Option<u32> {
        self.cpus.get(&cpu_id).map(|c| c.numa_node)
    }

    pub fn memory_capacity(&self, numa_node: u32) -> Option<u64> {
        self.node_index
            .get(&numa_node)
            .map(|i| self.memory[*i].capacity_bytes)
    }

    pub fn memory_nodes(&self) -> &[MemoryNode] {
        &self.memory
    }

    /// Distance between two nodes (lower is closer). Unknown nodes are
    /// treated as maximally distant.
    pub fn distance(&self, a: u32, b: u32) -> u32 {
        match (self.node_index.get(&a), self.node_index.get(&b)) {
            (Some(i), Some(j)) => self.distances[*i][*j],
            _ => u32::MAX,
        }
    }

    pub fn memory_granule_bytes(&self) -> u64 {
        self.memory_granule_bytes
    }

    /// Quantity one unit of `kind` is worth (vCPUs or bytes).
    pub fn unit_quantity(&self, kind: ResourceKind) -> f64 {
        match kind {
            ResourceKind::Cpu => 1.0,
            ResourceKind::Memory => self.memory_granule_bytes as f64,
        }
    }

    /// Every unit of a kind, ordered by id.
    pub fn units(&self, kind: ResourceKind) -> Vec<Unit> {
        match kind {
            ResourceKind::Cpu => self
                .cpus
                .values()
                .map(|c| Unit {
                    id: c.cpu_id,
                    numa_node: c.numa_node,
                })
                .collect(),
            ResourceKind::Memory => self
                .granule_nodes
                .iter()
                .enumerate()
                .map(|(id, node)| Unit {
                    id: id as u32,
                    numa_node: *node,
                })
                .collect(),
        }
    }

    /// NUMA node owning a unit.
    pub fn unit_node(&self, kind: ResourceKind, id: u32) -> Option<u32> {
        match kind {
            ResourceKind::Cpu => self.numa_of_cpu(id),
            ResourceKind::Memory => self.granule_nodes.get(id as usize).copied(),
        }
    }

    /// Total quantity of a kind across the machine.
    pub fn total_quantity(&self, kind: ResourceKind) -> f64 {
        let count = match kind {
            ResourceKind::Cpu => self.cpus.len(),
            ResourceKind::Memory => self.granule_nodes.len(),
        };
        count as f64 * self.unit_quantity(kind)
    }
}

fn default_distances(count: usize) -> Vec<Vec<u32>> {
    (0..count)
        .map(|i| (0..count).map(|j| u32::from(i != j)).collect())
        .collect()
}

fn validate_distances(
    distances: Vec<Vec<u32>>,
    expected: usize,
) -> Result<Vec<Vec<u32>>, TopologyError> {
    if distances.len() != expected || distances.iter().any(|row| row.len() != expected) {
        return Err(TopologyError::DistanceShape { expected });
    }

    for (row, values) in distances.iter().enumerate() {
        if values[row] != 0 {
            return Err(TopologyError::NonZeroDiagonal(row));
        }
        for col in (row + 1)..expected {
            if values[col] != distances[col][row] {
                return Err(TopologyError::AsymmetricDistance { row, col });
            }
        }
    }

    Ok(distances)
}
