//! Integration tests for the partition model.
//!
//! These drive `SubsetManager` directly on small hand-built topologies:
//! 1. Ratio changes open and close room for placements
//! 2. Reconciliation never lowers a ratio below what hosted domains need
//! 3. Random place/evict sequences keep subsets disjoint and admitted

use std::collections::BTreeSet;
use std::sync::Arc;

use proptest::prelude::*;
use rstest::rstest;
use vmsched_local::domain::{utilization_between, CpuTime};
use vmsched_local::manager::{PlacementError, UtilizationView};
use vmsched_local::subset::SubsetError;
use vmsched_local::topology::{CpuInfo, MemoryNode, RawTopology};
use vmsched_local::{
    Domain, DomainId, DomainSpec, ManagerConfig, ResourceKind, SubsetManager, Topology,
};
use vmsched_reconcile::RatioPolicy;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// `nodes` NUMA nodes with `cpus_per_node` CPUs and `memory_gib` each.
fn topology(nodes: u32, cpus_per_node: u32, memory_gib: u64) -> Arc<Topology> {
    let raw = RawTopology {
        cpus: (0..nodes * cpus_per_node)
            .map(|cpu_id| CpuInfo {
                cpu_id,
                numa_node: cpu_id / cpus_per_node,
                core_id: cpu_id % cpus_per_node,
            })
            .collect(),
        memory: (0..nodes)
            .map(|numa_node| MemoryNode {
                numa_node,
                capacity_bytes: memory_gib * GIB,
            })
            .collect(),
        distances: Vec::new(),
    };
    Arc::new(Topology::build(raw).unwrap())
}

fn manager(topology: Arc<Topology>) -> SubsetManager {
    SubsetManager::new(topology, ManagerConfig::default())
}

fn domain(name: &str, cpu_count: u32, memory_mb: u64, cpu_ratio: f64) -> Domain {
    Domain::new(DomainSpec {
        uuid: Some(DomainId::new()),
        name: Some(name.to_string()),
        memory_bytes: Some(memory_mb * MIB),
        cpu_count: Some(cpu_count),
        cpu_pin: Some(Vec::new()),
        cpu_ratio: Some(cpu_ratio),
    })
    .unwrap()
}

#[test]
fn test_ratio_opens_room_on_single_node() {
    let mut manager = manager(topology(1, 4, 8));

    let a = manager.place(domain("vm-a", 2, 1024, 2.0)).unwrap();
    let b = manager.place(domain("vm-b", 2, 1024, 2.0)).unwrap();
    assert_eq!(a.cpu_subset, b.cpu_subset);
    let cpu_subset = a.cpu_subset;
    assert_eq!(manager.subset(cpu_subset).unwrap().units().len(), 4);

    // 6 vCPUs on 4 CPUs at ratio 1.0
    let err = manager.place(domain("vm-c", 2, 1024, 2.0)).unwrap_err();
    assert!(matches!(
        err,
        PlacementError::NoCapacity {
            kind: ResourceKind::Cpu,
            ..
        }
    ));
    assert!(manager.find_by_name("vm-c").is_none());
    manager.check_invariants().unwrap();

    manager.set_ratio(cpu_subset, 1.5).unwrap();
    let c = manager.place(domain("vm-c", 2, 1024, 2.0)).unwrap();
    assert_eq!(c.cpu_subset, cpu_subset);

    let err = manager.place(domain("vm-d", 2, 1024, 2.0)).unwrap_err();
    assert!(matches!(err, PlacementError::NoCapacity { .. }));

    manager.set_ratio(cpu_subset, 2.0).unwrap();
    let d = manager.place(domain("vm-d", 2, 1024, 2.0)).unwrap();
    assert_eq!(d.cpu_subset, cpu_subset);

    let subset = manager.subset(cpu_subset).unwrap();
    assert_eq!(subset.current_demand(), 8.0);
    assert_eq!(subset.capacity(), 8.0);
    manager.check_invariants().unwrap();
}

#[test]
fn test_ratio_cannot_drop_below_hosted_demand() {
    let mut manager = manager(topology(1, 4, 8));
    let placement = manager.place(domain("vm-a", 4, 1024, 2.0)).unwrap();
    let id = placement.cpu_subset;
    manager.set_ratio(id, 1.5).unwrap();
    manager.place(domain("vm-b", 2, 1024, 2.0)).unwrap();

    let err = manager.set_ratio(id, 1.4).unwrap_err();
    assert!(matches!(
        err,
        PlacementError::Subset(SubsetError::Capacity { .. })
    ));
    assert_eq!(manager.subset(id).unwrap().ratio(), 1.5);
    assert_eq!(manager.subset(id).unwrap().ratio_floor(), 1.5);
}

#[test]
fn test_reconcile_lowering_stops_at_floor() {
    let config = ManagerConfig {
        policy: RatioPolicy {
            window: 1,
            ..RatioPolicy::default()
        },
        ..ManagerConfig::default()
    };
    let mut manager = SubsetManager::new(topology(1, 4, 8), config);
    let a = manager.place(domain("vm-a", 4, 1024, 2.0)).unwrap();
    let id = a.cpu_subset;
    manager.set_ratio(id, 1.6).unwrap();
    let b = manager.place(domain("vm-b", 2, 1024, 2.0)).unwrap();

    // Both domains saturate their CPUs.
    let mut view = UtilizationView::new();
    view.insert(ResourceKind::Cpu, a.uuid, 4.0);
    view.insert(ResourceKind::Cpu, b.uuid, 2.0);

    let report = manager.reconcile(&view);
    assert_eq!(report.ratio_changes.len(), 1);
    assert_eq!(report.ratio_changes[0].to, 1.5);

    for _ in 0..3 {
        let report = manager.reconcile(&view);
        assert!(report.ratio_changes.is_empty());
    }
    assert_eq!(manager.subset(id).unwrap().ratio(), 1.5);
    manager.check_invariants().unwrap();
}

#[test]
fn test_absent_domain_counts_zero() {
    let config = ManagerConfig {
        policy: RatioPolicy {
            window: 1,
            ..RatioPolicy::default()
        },
        ..ManagerConfig::default()
    };
    let mut manager = SubsetManager::new(topology(1, 4, 8), config);
    let a = manager.place(domain("vm-a", 2, 1024, 1.0)).unwrap();
    let b = manager.place(domain("vm-b", 2, 1024, 1.0)).unwrap();

    manager
        .set_domain_time(
            a.uuid,
            CpuTime {
                epoch_ns: 1_000_000_000,
                total_ns: 0,
                system_ns: 0,
                user_ns: 0,
            },
        )
        .unwrap();
    let utilization = manager
        .set_domain_time(
            a.uuid,
            CpuTime {
                epoch_ns: 2_000_000_000,
                total_ns: 2_000_000_000,
                system_ns: 500_000_000,
                user_ns: 1_500_000_000,
            },
        )
        .unwrap();
    assert_eq!(utilization, Some(2.0));

    let mut view = UtilizationView::new();
    view.insert(ResourceKind::Cpu, a.uuid, 2.0);
    view.insert(ResourceKind::Cpu, b.uuid, 1.0);
    let report = manager.reconcile(&view);
    assert_eq!(report.utilization[&a.cpu_subset], 3.0);

    // vm-a vanished from the hypervisor this tick.
    manager.clear_domain_time(a.uuid).unwrap();
    assert_eq!(manager.domain(a.uuid).unwrap().time(), None);
    let mut view = UtilizationView::new();
    view.mark_absent(ResourceKind::Cpu, a.uuid);
    view.insert(ResourceKind::Cpu, b.uuid, 1.0);
    let report = manager.reconcile(&view);
    assert_eq!(report.utilization[&a.cpu_subset], 1.0);

    // Without any reading for vm-a the subset is held instead.
    let mut view = UtilizationView::new();
    view.insert(ResourceKind::Cpu, b.uuid, 1.0);
    let report = manager.reconcile(&view);
    assert!(report.held.contains(&a.cpu_subset));
    assert!(!report.utilization.contains_key(&a.cpu_subset));
}

#[test]
fn test_failed_placement_leaves_partition_untouched() {
    let mut manager = manager(topology(2, 2, 1));
    manager.place(domain("vm-a", 1, 512, 1.0)).unwrap();
    let before = manager.describe();

    // Fits in CPUs, not in the memory of any node.
    let err = manager.place(domain("vm-big", 1, 2048, 1.0)).unwrap_err();
    assert!(matches!(
        err,
        PlacementError::NoCapacity {
            kind: ResourceKind::Memory,
            ..
        }
    ));
    assert_eq!(manager.describe(), before);
    manager.check_invariants().unwrap();
}

#[test]
fn test_evicting_last_domain_releases_subsets() {
    let mut manager = manager(topology(1, 4, 8));
    let a = manager.place(domain("vm-a", 2, 1024, 1.0)).unwrap();
    assert_eq!(manager.subsets().count(), 2);

    let evicted = manager.evict(a.uuid).unwrap();
    assert_eq!(evicted.name(), "vm-a");
    assert_eq!(manager.subsets().count(), 0);
    assert_eq!(manager.free_units(ResourceKind::Cpu).len(), 4);
    assert!(matches!(
        manager.evict(a.uuid),
        Err(PlacementError::NotFound(_))
    ));
}

#[rstest]
#[case::half_core(1_000_000_000, 0, 2_000_000_000, 500_000_000, Some(0.5))]
#[case::two_cores(0, 0, 1_000_000_000, 2_000_000_000, Some(2.0))]
#[case::idle(0, 7, 1_000, 7, Some(0.0))]
#[case::same_instant(5, 0, 5, 100, None)]
#[case::counter_reset(0, 900, 1_000, 100, None)]
fn test_utilization_derivation(
    #[case] prev_epoch: u64,
    #[case] prev_total: u64,
    #[case] next_epoch: u64,
    #[case] next_total: u64,
    #[case] expected: Option<f64>,
) {
    let at = |epoch_ns, total_ns| CpuTime {
        epoch_ns,
        total_ns,
        system_ns: 0,
        user_ns: total_ns,
    };
    assert_eq!(
        utilization_between(&at(prev_epoch, prev_total), &at(next_epoch, next_total)),
        expected
    );
}

// =============================================================================
// Random sequences
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Place {
        cpu_count: u32,
        granules: u64,
        cpu_ratio: f64,
    },
    Evict(usize),
    Reconcile(f64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1u32..=3, 1u64..=8, 1.0f64..=2.0).prop_map(|(cpu_count, granules, cpu_ratio)| {
            Op::Place {
                cpu_count,
                granules,
                cpu_ratio,
            }
        }),
        1 => any::<usize>().prop_map(Op::Evict),
        1 => (0.0f64..=2.0).prop_map(Op::Reconcile),
    ]
}

fn assert_partitioned(manager: &SubsetManager) -> Result<(), TestCaseError> {
    prop_assert_eq!(manager.check_invariants(), Ok(()));
    for kind in ResourceKind::ALL {
        let mut seen = BTreeSet::new();
        for subset in manager.subsets().filter(|s| s.kind() == kind) {
            for unit in subset.units() {
                prop_assert!(seen.insert(*unit), "{} unit {} owned twice", kind, unit);
            }
            prop_assert!(subset.current_demand() <= subset.capacity() + 1e-9);
            prop_assert!(subset.ratio() >= 1.0);
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_subsets_stay_disjoint_and_admitted(ops in prop::collection::vec(op(), 1..40)) {
        let mut manager = manager(topology(2, 4, 2));
        let mut placed: Vec<DomainId> = Vec::new();

        for (i, op) in ops.into_iter().enumerate() {
            match op {
                Op::Place { cpu_count, granules, cpu_ratio } => {
                    let before = manager.describe();
                    let domain = domain(&format!("vm-{i}"), cpu_count, granules * 256, cpu_ratio);
                    let uuid = domain.uuid();
                    match manager.place(domain) {
                        Ok(placement) => {
                            prop_assert_eq!(placement.uuid, uuid);
                            placed.push(uuid);
                        }
                        Err(_) => prop_assert_eq!(manager.describe(), before),
                    }
                }
                Op::Evict(pick) => {
                    if !placed.is_empty() {
                        let uuid = placed.remove(pick % placed.len());
                        prop_assert!(manager.evict(uuid).is_ok());
                    }
                }
                Op::Reconcile(load) => {
                    let mut view = UtilizationView::new();
                    for uuid in &placed {
                        view.insert(ResourceKind::Cpu, *uuid, load);
                    }
                    manager.reconcile(&view);
                }
            }
            assert_partitioned(&manager)?;
        }

        prop_assert_eq!(manager.domains().count(), placed.len());
    }
}
