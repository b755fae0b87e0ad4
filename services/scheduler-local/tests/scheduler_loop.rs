//! Integration tests for the scheduler loop and partition actor.
//!
//! These run the real actor, endpoint pool and live loader against
//! MockHypervisor with a manual clock:
//! 1. Commands go through SchedulerHandle
//! 2. Ticks sample the mock and reconcile
//! 3. Shutdown lets the in-flight tick land, then answers pending
//!    commands instead of dropping them

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Notify, Semaphore};
use vmsched_local::actors::{ActorRef, EvictTarget};
use vmsched_local::endpoint::{
    Endpoint, EndpointError, EndpointPool, JsonEndpoint, LiveEndpoint, Sample, SaverConfig,
    SubsetView,
};
use vmsched_local::hypervisor::MockHypervisor;
use vmsched_local::manager::PartitionSnapshot;
use vmsched_local::scheduler::SchedulerConfig;
use vmsched_local::topology::{CpuInfo, MemoryNode, RawTopology};
use vmsched_local::{
    DomainSpec, ManagerConfig, ResourceKind, Scheduler, SchedulerContext, SchedulerError,
    SchedulerHandle, Shutdown, SubsetManager, Topology,
};
use vmsched_reconcile::RatioPolicy;

const GIB: u64 = 1024 * 1024 * 1024;

fn single_node(cpus: u32) -> Arc<Topology> {
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
            capacity_bytes: 8 * GIB,
        }],
        distances: Vec::new(),
    };
    Arc::new(Topology::build(raw).unwrap())
}

fn spec(name: &str, cpu_count: u32) -> DomainSpec {
    DomainSpec {
        name: Some(name.to_string()),
        cpu_count: Some(cpu_count),
        memory_bytes: Some(GIB),
        cpu_ratio: Some(2.0),
        ..DomainSpec::default()
    }
}

struct Harness {
    hypervisor: Arc<MockHypervisor>,
    handle: SchedulerHandle,
    scheduler: Scheduler,
    actor: ActorRef,
    stages: Shutdown,
}

fn harness(config: ManagerConfig, pool: impl FnOnce(Arc<MockHypervisor>) -> EndpointPool) -> Harness {
    let hypervisor = Arc::new(MockHypervisor::with_manual_clock());
    let topology = single_node(4);
    let stages = Shutdown::new();
    let manager = SubsetManager::new(topology.clone(), config);
    let (handle, actor) =
        SchedulerHandle::spawn(manager, hypervisor.clone(), 32, stages.partition_signal());
    let scheduler = Scheduler::new(SchedulerContext {
        topology,
        handle: handle.clone(),
        pool: pool(hypervisor.clone()),
        config: SchedulerConfig {
            tick: Duration::from_millis(10),
            mailbox_size: 32,
        },
    });
    Harness {
        hypervisor,
        handle,
        scheduler,
        actor,
        stages,
    }
}

fn live_pool(hypervisor: Arc<MockHypervisor>) -> EndpointPool {
    EndpointPool::new(Arc::new(LiveEndpoint::new(hypervisor)))
}

fn fast_policy() -> ManagerConfig {
    ManagerConfig {
        policy: RatioPolicy {
            window: 2,
            ..RatioPolicy::default()
        },
        ..ManagerConfig::default()
    }
}

/// Every subset's hosted list agrees with every domain's subset fields.
fn assert_index_consistent(snapshot: &PartitionSnapshot) {
    for domain in &snapshot.domains {
        for (kind, id) in [
            (ResourceKind::Cpu, domain.cpu_subset),
            (ResourceKind::Memory, domain.memory_subset),
        ] {
            let id = id.unwrap_or_else(|| panic!("{} has no {kind} subset", domain.name));
            let subset = snapshot.subsets.iter().find(|s| s.id == id).unwrap();
            assert_eq!(subset.kind, kind);
            assert!(subset.domains.contains(&domain.uuid));
        }
    }
    for subset in &snapshot.subsets {
        for uuid in &subset.domains {
            assert!(snapshot.domains.iter().any(|d| d.uuid == *uuid));
        }
    }
}

#[tokio::test]
async fn test_ticks_track_hypervisor_load() {
    let mut h = harness(fast_policy(), live_pool);

    let a = h.handle.place(spec("vm-a", 2)).await.unwrap();
    h.hypervisor.set_load(a.uuid, 2.0);

    // First reading only establishes the baseline.
    let first = h.scheduler.tick().await.unwrap();
    assert_eq!(first.sampled, 2);
    assert!(first.report.held.contains(&a.cpu_subset));
    assert!(!first.report.utilization.contains_key(&a.cpu_subset));
    let info = h.handle.describe().await.unwrap();
    let cpu = info.subsets.iter().find(|s| s.id == a.cpu_subset).unwrap();
    assert_eq!(cpu.utilization, None);

    h.hypervisor.advance(Duration::from_secs(1));
    let second = h.scheduler.tick().await.unwrap();
    let utilization = second.report.utilization[&a.cpu_subset];
    assert!((utilization - 2.0).abs() < 1e-6, "{utilization}");

    let info = h.handle.describe().await.unwrap();
    let memory = info
        .subsets
        .iter()
        .find(|s| s.id == a.memory_subset)
        .unwrap();
    assert_eq!(memory.utilization, Some(GIB as f64));
    assert_eq!(h.scheduler.ticks(), 2);
}

#[tokio::test]
async fn test_absent_domain_stops_contributing() {
    let mut h = harness(fast_policy(), live_pool);

    let a = h.handle.place(spec("vm-a", 1)).await.unwrap();
    let b = h.handle.place(spec("vm-b", 1)).await.unwrap();
    assert_eq!(a.cpu_subset, b.cpu_subset);
    h.hypervisor.set_load(a.uuid, 1.0);
    h.hypervisor.set_load(b.uuid, 0.5);

    h.scheduler.tick().await.unwrap();
    h.hypervisor.advance(Duration::from_secs(1));
    let busy = h.scheduler.tick().await.unwrap();
    assert!((busy.report.utilization[&a.cpu_subset] - 1.5).abs() < 1e-6);

    h.hypervisor.stop(a.uuid);
    h.hypervisor.advance(Duration::from_secs(1));
    let after = h.scheduler.tick().await.unwrap();
    assert_eq!(after.absent, 2);
    // Only vm-b's half core remains.
    assert!((after.report.utilization[&a.cpu_subset] - 0.5).abs() < 1e-6);
}

#[tokio::test]
async fn test_unreadable_domain_is_skipped() {
    let mut h = harness(fast_policy(), live_pool);

    let a = h.handle.place(spec("vm-a", 1)).await.unwrap();
    h.hypervisor.set_fail_reads(a.uuid, true);

    let summary = h.scheduler.tick().await.unwrap();
    // CPU counters fail, the memory request is still known.
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.sampled, 1);
    assert_eq!(summary.absent, 0);
}

#[tokio::test]
async fn test_unreadable_load_never_raises_ratio() {
    let mut h = harness(fast_policy(), live_pool);

    let a = h.handle.place(spec("vm-a", 2)).await.unwrap();
    h.hypervisor.set_load(a.uuid, 2.0);
    h.hypervisor.set_fail_reads(a.uuid, true);

    for _ in 0..5 {
        h.hypervisor.advance(Duration::from_secs(1));
        let summary = h.scheduler.tick().await.unwrap();
        assert!(summary.report.ratio_changes.is_empty());
        assert!(summary.report.held.contains(&a.cpu_subset));
    }

    let info = h.handle.describe().await.unwrap();
    let cpu = info.subsets.iter().find(|s| s.id == a.cpu_subset).unwrap();
    assert_eq!(cpu.ratio, 1.0);
    assert_eq!(cpu.utilization, None);
}

#[tokio::test]
async fn test_lost_hypervisor_skips_every_subset() {
    let mut h = harness(fast_policy(), live_pool);

    h.handle.place(spec("vm-a", 1)).await.unwrap();
    h.handle.place(spec("vm-b", 1)).await.unwrap();
    h.hypervisor.set_fail_listing(true);

    let summary = h.scheduler.tick().await.unwrap();
    assert_eq!(summary.skipped, 4);
    assert_eq!(summary.sampled, 0);
    assert_eq!(summary.absent, 0);
    assert_eq!(summary.report.held.len(), 2);
    assert!(summary.report.ratio_changes.is_empty());

    h.hypervisor.set_fail_listing(false);
    let summary = h.scheduler.tick().await.unwrap();
    assert_eq!(summary.sampled, 4);
}

#[tokio::test]
async fn test_concurrent_place_and_evict() {
    let h = harness(ManagerConfig::default(), live_pool);

    let a = h.handle.place(spec("vm-a", 1)).await.unwrap();
    h.handle.place(spec("vm-b", 1)).await.unwrap();

    let placer = h.handle.clone();
    let evicter = h.handle.clone();
    let (placed, evicted) = tokio::join!(
        tokio::spawn(async move { placer.place(spec("vm-c", 1)).await }),
        tokio::spawn(async move { evicter.evict(EvictTarget::Name("vm-a".to_string())).await }),
    );
    let placed = placed.unwrap().unwrap();
    assert_eq!(evicted.unwrap().unwrap(), a.uuid);
    assert_eq!(placed.cpu_subset, a.cpu_subset);

    let snapshot = h.handle.describe().await.unwrap();
    let names: Vec<&str> = snapshot.domains.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, vec!["vm-b", "vm-c"]);
    assert_index_consistent(&snapshot);
    assert_eq!(h.hypervisor.domain_count(), 2);
}

#[tokio::test]
async fn test_many_concurrent_commands_keep_index() {
    let h = harness(ManagerConfig::default(), live_pool);

    // At most four single-vCPU domains are ever alive on the four CPUs.
    let tasks: Vec<_> = (0..4)
        .map(|i| {
            let handle = h.handle.clone();
            tokio::spawn(async move {
                let placement = handle.place(spec(&format!("vm-{i}"), 1)).await?;
                if i % 2 == 0 {
                    handle.evict(EvictTarget::Uuid(placement.uuid)).await?;
                }
                Ok::<_, SchedulerError>(())
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let snapshot = h.handle.describe().await.unwrap();
    assert_eq!(snapshot.domains.len(), 2);
    assert_index_consistent(&snapshot);
}

#[tokio::test]
async fn test_hypervisor_failure_rolls_back_placement() {
    let h = harness(ManagerConfig::default(), live_pool);
    h.handle.place(spec("vm-a", 1)).await.unwrap();
    let before = h.handle.describe().await.unwrap();

    h.hypervisor.set_fail_creates(true);
    let err = h.handle.place(spec("vm-b", 1)).await.unwrap_err();
    assert!(matches!(err, SchedulerError::Hypervisor(_)));
    assert_eq!(h.handle.describe().await.unwrap(), before);
    assert_eq!(h.hypervisor.domain_count(), 1);
}

#[tokio::test]
async fn test_recorded_samples_replay() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("samples.json");

    let recorder = JsonEndpoint::open(None, Some(path.clone())).await.unwrap();
    let mut h = harness(fast_policy(), move |hypervisor| {
        live_pool(hypervisor).with_saver(Arc::new(recorder), SaverConfig::default())
    });
    let a = h.handle.place(spec("vm-a", 1)).await.unwrap();
    h.hypervisor.set_load(a.uuid, 1.0);
    h.scheduler.tick().await.unwrap();
    h.hypervisor.advance(Duration::from_secs(1));
    h.scheduler.tick().await.unwrap();
    h.scheduler.pool().flush().await;
    drop(h);

    let replay = JsonEndpoint::open(Some(path.as_path()), None).await.unwrap();
    let mut h = harness(fast_policy(), move |_| EndpointPool::new(Arc::new(replay)));
    let b = h.handle.place(spec("vm-a", 1)).await.unwrap();
    let summary = h.scheduler.tick().await.unwrap();
    // Matched by name; the replayed domain has a fresh uuid.
    assert_eq!(summary.absent, 0);
    assert_eq!(summary.sampled, 2);
    assert!(summary.report.utilization[&b.cpu_subset] > 0.0);
}

#[tokio::test]
async fn test_run_stops_and_rejects_commands() {
    let h = harness(ManagerConfig::default(), live_pool);
    let handle = h.handle.clone();
    let run = tokio::spawn(h.scheduler.run(h.stages.loop_signal()));

    handle.place(spec("vm-a", 1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let applied = h
        .stages
        .stop(run, h.actor, Duration::from_secs(5))
        .await;
    assert!(applied.is_some_and(|n| n >= 1), "{applied:?}");

    let err = handle.describe().await.unwrap_err();
    assert!(matches!(err, SchedulerError::ShuttingDown));
}

/// Loader that parks every load until the test opens it.
struct GatedLoader {
    entered: Arc<Notify>,
    open: Arc<Semaphore>,
}

#[async_trait]
impl Endpoint for GatedLoader {
    fn name(&self) -> &str {
        "gated"
    }

    async fn load_subset(
        &self,
        timestamp: DateTime<Utc>,
        view: &SubsetView,
    ) -> Result<Vec<Sample>, EndpointError> {
        self.entered.notify_one();
        let _permit = self
            .open
            .acquire()
            .await
            .map_err(|e| EndpointError::Format(e.to_string()))?;

        let mut samples: Vec<Sample> = view
            .domains
            .iter()
            .map(|d| Sample::domain(timestamp, view, d, Some(d.request * 0.5), None))
            .collect();
        let total = samples.iter().filter_map(|s| s.value).sum();
        samples.push(Sample::subset(timestamp, view, total));
        Ok(samples)
    }
}

#[tokio::test]
async fn test_shutdown_mid_tick_applies_samples() {
    let entered = Arc::new(Notify::new());
    let open = Arc::new(Semaphore::new(0));
    let loader = GatedLoader {
        entered: entered.clone(),
        open: open.clone(),
    };
    let h = harness(ManagerConfig::default(), move |_| {
        EndpointPool::new(Arc::new(loader))
    });
    let handle = h.handle.clone();
    handle.place(spec("vm-a", 2)).await.unwrap();

    let run = tokio::spawn(h.scheduler.run(h.stages.loop_signal()));
    tokio::time::timeout(Duration::from_secs(5), entered.notified())
        .await
        .unwrap();

    // Stop while the first tick is parked inside the loader.
    let stop = tokio::spawn(h.stages.stop(run, h.actor, Duration::from_secs(5)));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!stop.is_finished());
    assert!(handle.describe().await.is_ok());

    open.add_permits(1);
    let applied = stop.await.unwrap();
    assert_eq!(applied, Some(1));

    let err = handle.describe().await.unwrap_err();
    assert!(matches!(err, SchedulerError::ShuttingDown));
}
