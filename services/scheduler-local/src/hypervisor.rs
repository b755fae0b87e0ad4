//! Hypervisor connector interface and mock implementation.
//!
//! The connector abstracts the domain lifecycle primitives the scheduler
//! needs:
//! - Creating and destroying domains
//! - Pinning vCPUs to physical CPUs
//! - Reading cumulative CPU-time counters
//!
//! A mock implementation is provided for testing and development.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::domain::{CpuTime, Domain, DomainId};

/// A hypervisor call failed.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("hypervisor error{}: {message}", domain_suffix(.uuid))]
pub struct HypervisorError {
    /// Domain the call was about, if any.
    pub uuid: Option<DomainId>,
    pub message: String,
}

fn domain_suffix(uuid: &Option<DomainId>) -> String {
    uuid.map(|u| format!(" for domain {u}")).unwrap_or_default()
}

impl HypervisorError {
    pub fn for_domain(uuid: DomainId, message: impl Into<String>) -> Self {
        Self {
            uuid: Some(uuid),
            message: message.into(),
        }
    }

    pub fn global(message: impl Into<String>) -> Self {
        Self {
            uuid: None,
            message: message.into(),
        }
    }
}

/// Domain lifecycle and counter primitives.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Define and start a domain.
    async fn create(&self, domain: &Domain) -> Result<DomainId, HypervisorError>;

    /// Stop and undefine a domain.
    async fn destroy(&self, uuid: DomainId) -> Result<(), HypervisorError>;

    /// Restrict one vCPU to a set of physical CPUs (empty = floating).
    async fn pin(
        &self,
        uuid: DomainId,
        vcpu: usize,
        cpus: &BTreeSet<u32>,
    ) -> Result<(), HypervisorError>;

    /// Read cumulative CPU time.
    async fn read_counters(&self, uuid: DomainId) -> Result<CpuTime, HypervisorError>;

    /// Domains currently running.
    async fn list_active(&self) -> Result<HashSet<DomainId>, HypervisorError>;
}

#[derive(Debug, Clone)]
struct MockDomain {
    name: String,
    /// Cores kept busy.
    load: f64,
    running: bool,
    last_epoch_ns: u64,
    total_ns: u64,
    pins: Vec<BTreeSet<u32>>,
}

#[derive(Debug, Default)]
struct MockState {
    domains: HashMap<DomainId, MockDomain>,
    failing_reads: HashSet<DomainId>,
    manual_epoch_ns: Option<u64>,
}

/// In-memory hypervisor for testing and development.
///
/// Counters advance from a monotonic clock, or from a manual clock driven
/// by [`MockHypervisor::advance`] when built with
/// [`MockHypervisor::with_manual_clock`].
pub struct MockHypervisor {
    started: Instant,
    fail_creates: AtomicBool,
    fail_listing: AtomicBool,
    default_load: f64,
    state: Mutex<MockState>,
}

impl MockHypervisor {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            fail_creates: AtomicBool::new(false),
            fail_listing: AtomicBool::new(false),
            default_load: 0.0,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Counters only move when [`advance`](Self::advance) is called.
    pub fn with_manual_clock() -> Self {
        let hypervisor = Self::new();
        hypervisor.with_state(|state| state.manual_epoch_ns = Some(1));
        hypervisor
    }

    /// Load (in cores) given to newly created domains.
    pub fn with_default_load(mut self, load: f64) -> Self {
        self.default_load = load;
        self
    }

    /// Make every subsequent create fail.
    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// Make `list_active` fail, as when the connection to the hypervisor
    /// is lost.
    pub fn set_fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    /// Make counter reads for one domain fail.
    pub fn set_fail_reads(&self, uuid: DomainId, fail: bool) {
        self.with_state(|state| {
            if fail {
                state.failing_reads.insert(uuid);
            } else {
                state.failing_reads.remove(&uuid);
            }
        });
    }

    /// Change the load of a domain.
    pub fn set_load(&self, uuid: DomainId, load: f64) {
        self.with_state(|state| {
            let now = Self::epoch_ns(self.started, state);
            if let Some(domain) = state.domains.get_mut(&uuid) {
                Self::accumulate(domain, now);
                domain.load = load;
            }
        });
    }

    /// Mark a domain stopped (it disappears from `list_active`).
    pub fn stop(&self, uuid: DomainId) {
        self.with_state(|state| {
            if let Some(domain) = state.domains.get_mut(&uuid) {
                domain.running = false;
            }
        });
    }

    /// Advance the manual clock.
    pub fn advance(&self, by: Duration) {
        self.with_state(|state| {
            if let Some(epoch) = state.manual_epoch_ns.as_mut() {
                *epoch += by.as_nanos() as u64;
            }
        });
    }

    /// Current pins of a domain, if it exists.
    pub fn pins(&self, uuid: DomainId) -> Option<Vec<BTreeSet<u32>>> {
        self.with_state(|state| state.domains.get(&uuid).map(|d| d.pins.clone()))
    }

    pub fn domain_count(&self) -> usize {
        self.with_state(|state| state.domains.len())
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }

    fn epoch_ns(started: Instant, state: &MockState) -> u64 {
        state
            .manual_epoch_ns
            .unwrap_or_else(|| started.elapsed().as_nanos() as u64 + 1)
    }

    fn accumulate(domain: &mut MockDomain, now: u64) {
        let elapsed = now.saturating_sub(domain.last_epoch_ns) as f64;
        domain.total_ns += (elapsed * domain.load) as u64;
        domain.last_epoch_ns = now;
    }
}

impl Default for MockHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    async fn create(&self, domain: &Domain) -> Result<DomainId, HypervisorError> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(HypervisorError::for_domain(
                domain.uuid(),
                "mock hypervisor configured to fail",
            ));
        }

        info!(
            uuid = %domain.uuid(),
            name = %domain.name(),
            cpu_count = domain.cpu_count(),
            memory_mb = domain.memory_bytes() / (1024 * 1024),
            "[MOCK] Creating domain"
        );

        self.with_state(|state| {
            let now = Self::epoch_ns(self.started, state);
            state.domains.insert(
                domain.uuid(),
                MockDomain {
                    name: domain.name().to_string(),
                    load: self.default_load,
                    running: true,
                    last_epoch_ns: now,
                    total_ns: 0,
                    pins: domain.cpu_pin().clone(),
                },
            );
        });
        Ok(domain.uuid())
    }

    async fn destroy(&self, uuid: DomainId) -> Result<(), HypervisorError> {
        let removed = self.with_state(|state| state.domains.remove(&uuid));
        match removed {
            Some(domain) => {
                info!(uuid = %uuid, name = %domain.name, "[MOCK] Destroyed domain");
                Ok(())
            }
            None => Err(HypervisorError::for_domain(uuid, "no such domain")),
        }
    }

    async fn pin(
        &self,
        uuid: DomainId,
        vcpu: usize,
        cpus: &BTreeSet<u32>,
    ) -> Result<(), HypervisorError> {
        self.with_state(|state| {
            let domain = state
                .domains
                .get_mut(&uuid)
                .ok_or_else(|| HypervisorError::for_domain(uuid, "no such domain"))?;
            let slot = domain.pins.get_mut(vcpu).ok_or_else(|| {
                HypervisorError::for_domain(uuid, format!("no vCPU {vcpu}"))
            })?;
            slot.clone_from(cpus);
            debug!(uuid = %uuid, vcpu, cpus = ?cpus, "[MOCK] Pinned vCPU");
            Ok(())
        })
    }

    async fn read_counters(&self, uuid: DomainId) -> Result<CpuTime, HypervisorError> {
        self.with_state(|state| {
            if state.failing_reads.contains(&uuid) {
                return Err(HypervisorError::for_domain(uuid, "counters unreadable"));
            }
            let now = Self::epoch_ns(self.started, state);
            let domain = state
                .domains
                .get_mut(&uuid)
                .filter(|d| d.running)
                .ok_or_else(|| HypervisorError::for_domain(uuid, "domain not running"))?;
            Self::accumulate(domain, now);

            let system_ns = domain.total_ns / 10;
            Ok(CpuTime {
                epoch_ns: now,
                total_ns: domain.total_ns,
                system_ns,
                user_ns: domain.total_ns - system_ns,
            })
        })
    }

    async fn list_active(&self) -> Result<HashSet<DomainId>, HypervisorError> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(HypervisorError::global("mock hypervisor connection lost"));
        }
        Ok(self.with_state(|state| {
            state
                .domains
                .iter()
                .filter(|(_, d)| d.running)
                .map(|(uuid, _)| *uuid)
                .collect()
        }))
    }
}
