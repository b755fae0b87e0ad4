//! Subsets: oversubscribable slices of one NUMA node's CPUs or memory.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{Domain, DomainId};
use crate::topology::ResourceKind;

/// Small slack for float comparisons on capacities.
const CAPACITY_EPSILON: f64 = 1e-9;

/// Internal subset identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubsetId(pub u32);

impl fmt::Display for SubsetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subset-{}", self.0)
    }
}

/// Subset-local invariant violations. The subset is left unchanged.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SubsetError {
    #[error("{subset} cannot admit {requested}: demand {demand} of capacity {capacity}")]
    Capacity {
        subset: SubsetId,
        requested: f64,
        demand: f64,
        capacity: f64,
    },

    #[error("domain {uuid} is pinned outside the CPUs of {subset}")]
    PinConflict { subset: SubsetId, uuid: DomainId },

    #[error("cannot resize {subset}: {reason}")]
    Resize { subset: SubsetId, reason: String },

    #[error("invalid oversubscription ratio {0}")]
    InvalidRatio(f64),
}

impl SubsetError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Capacity { .. } => "capacity",
            Self::PinConflict { .. } => "pin_conflict",
            Self::Resize { .. } => "resize_rejected",
            Self::InvalidRatio(_) => "invalid_ratio",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Hosted {
    uuid: DomainId,
    request: f64,
    /// Pinned by this subset to its full CPU set (as opposed to pre-pinned).
    auto_pinned: bool,
}

/// A slice of one resource kind on one NUMA node.
#[derive(Debug, Clone, PartialEq)]
pub struct Subset {
    id: SubsetId,
    kind: ResourceKind,
    numa_node: u32,
    units: BTreeSet<u32>,
    unit_quantity: f64,
    ratio: f64,
    reserved: bool,
    hosted: Vec<Hosted>,
}

impl Subset {
    pub fn new(
        id: SubsetId,
        kind: ResourceKind,
        numa_node: u32,
        units: BTreeSet<u32>,
        unit_quantity: f64,
        ratio: f64,
    ) -> Result<Self, SubsetError> {
        if !ratio.is_finite() || ratio < 1.0 {
            return Err(SubsetError::InvalidRatio(ratio));
        }
        Ok(Self {
            id,
            kind,
            numa_node,
            units,
            unit_quantity,
            ratio,
            reserved: false,
            hosted: Vec::new(),
        })
    }

    pub fn id(&self) -> SubsetId {
        self.id
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn numa_node(&self) -> u32 {
        self.numa_node
    }

    pub fn units(&self) -> &BTreeSet<u32> {
        &self.units
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    pub fn is_reserved(&self) -> bool {
        self.reserved
    }

    pub(crate) fn set_reserved(&mut self, reserved: bool) {
        self.reserved = reserved;
    }

    /// Hosted domains in arrival order.
    pub fn hosted(&self) -> impl Iterator<Item = DomainId> + '_ {
        self.hosted.iter().map(|h| h.uuid)
    }

    pub fn hosts(&self, uuid: DomainId) -> bool {
        self.hosted.iter().any(|h| h.uuid == uuid)
    }

    pub fn is_empty(&self) -> bool {
        self.hosted.is_empty()
    }

    /// Physical quantity owned (vCPUs or bytes), before oversubscription.
    pub fn raw_capacity(&self) -> f64 {
        self.units.len() as f64 * self.unit_quantity
    }

    /// Admitted capacity: raw capacity times the oversubscription ratio.
    pub fn capacity(&self) -> f64 {
        self.raw_capacity() * self.ratio
    }

    /// Sum of the configured requests of hosted domains.
    pub fn current_demand(&self) -> f64 {
        self.hosted.iter().map(|h| h.request).sum()
    }

    pub fn can_admit(&self, domain: &Domain) -> bool {
        fits(
            self.current_demand() + domain.request(self.kind),
            self.capacity(),
        )
    }

    /// Lowest ratio that keeps the hosted demand admitted.
    pub fn ratio_floor(&self) -> f64 {
        let raw = self.raw_capacity();
        if raw <= 0.0 {
            return 1.0;
        }
        (self.current_demand() / raw).max(1.0)
    }

    /// Host a domain. CPU subsets pin floating domains to all their CPUs
    /// and reject pre-pinned domains that reach outside them.
    pub fn add(&mut self, domain: &mut Domain) -> Result<(), SubsetError> {
        if self.hosts(domain.uuid()) {
            return Ok(());
        }
        if !self.can_admit(domain) {
            return Err(self.capacity_error(domain.request(self.kind)));
        }

        let mut auto_pinned = false;
        if self.kind == ResourceKind::Cpu {
            if domain.is_pinned() {
                if !domain.pinned_cpus().is_subset(&self.units) {
                    return Err(SubsetError::PinConflict {
                        subset: self.id,
                        uuid: domain.uuid(),
                    });
                }
            } else {
                domain.pin_all(&self.units);
                auto_pinned = true;
            }
        }

        self.hosted.push(Hosted {
            uuid: domain.uuid(),
            request: domain.request(self.kind),
            auto_pinned,
        });
        Ok(())
    }

    /// Stop hosting a domain. No-op if it is not hosted here.
    pub fn remove(&mut self, domain: &mut Domain) -> bool {
        let removed = self.remove_id(domain.uuid());
        if removed && self.kind == ResourceKind::Cpu {
            domain.clear_cpu_pin();
        }
        removed
    }

    /// Drop a domain from the hosted list without touching the domain.
    pub fn remove_id(&mut self, uuid: DomainId) -> bool {
        let before = self.hosted.len();
        self.hosted.retain(|h| h.uuid != uuid);
        self.hosted.len() != before
    }

    /// Replace the owned units.
    ///
    /// Domains auto-pinned to the old unit set are re-pinned to the new one;
    /// their ids are returned. `domains` must contain every hosted domain.
    pub fn resize(
        &mut self,
        new_units: BTreeSet<u32>,
        domains: &mut HashMap<DomainId, Domain>,
    ) -> Result<Vec<DomainId>, SubsetError> {
        if new_units.is_empty() {
            return Err(self.resize_error("a subset must own at least one unit".to_string()));
        }

        let new_capacity = new_units.len() as f64 * self.unit_quantity * self.ratio;
        if !fits(self.current_demand(), new_capacity) {
            return Err(self.resize_error(format!(
                "capacity {new_capacity} below demand {}",
                self.current_demand()
            )));
        }

        if self.kind == ResourceKind::Cpu {
            for hosted in self.hosted.iter().filter(|h| !h.auto_pinned) {
                let stranded = domains
                    .get(&hosted.uuid)
                    .is_some_and(|d| !d.pinned_cpus().is_subset(&new_units));
                if stranded {
                    return Err(self.resize_error(format!(
                        "domain {} is pinned to a removed CPU",
                        hosted.uuid
                    )));
                }
            }
        }

        self.units = new_units;

        let mut repinned = Vec::new();
        if self.kind == ResourceKind::Cpu {
            for hosted in self.hosted.iter().filter(|h| h.auto_pinned) {
                if let Some(domain) = domains.get_mut(&hosted.uuid) {
                    domain.pin_all(&self.units);
                    repinned.push(hosted.uuid);
                }
            }
        }
        Ok(repinned)
    }

    pub fn set_oversubscription_ratio(&mut self, ratio: f64) -> Result<(), SubsetError> {
        if !ratio.is_finite() || ratio < 1.0 {
            return Err(SubsetError::InvalidRatio(ratio));
        }
        let capacity = self.raw_capacity() * ratio;
        if !fits(self.current_demand(), capacity) {
            return Err(SubsetError::Capacity {
                subset: self.id,
                requested: 0.0,
                demand: self.current_demand(),
                capacity,
            });
        }
        self.ratio = ratio;
        Ok(())
    }

    fn capacity_error(&self, requested: f64) -> SubsetError {
        SubsetError::Capacity {
            subset: self.id,
            requested,
            demand: self.current_demand(),
            capacity: self.capacity(),
        }
    }

    fn resize_error(&self, reason: String) -> SubsetError {
        SubsetError::Resize {
            subset: self.id,
            reason,
        }
    }
}

fn fits(demand: f64, capacity: f64) -> bool {
    demand <= capacity + CAPACITY_EPSILON
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::tests::spec;

    fn cpu_subset(units: &[u32], ratio: f64) -> Subset {
        Subset::new(
            SubsetId(1),
            ResourceKind::Cpu,
            0,
            units.iter().copied().collect(),
            1.0,
            ratio,
        )
        .unwrap()
    }

    fn domain(cpus: u32) -> Domain {
        Domain::new(spec("vm", cpus, 512, 2.0)).unwrap()
    }

    #[test]
    fn test_capacity_and_demand() {
        let mut subset = cpu_subset(&[0, 1, 2, 3], 1.5);
        assert_eq!(subset.raw_capacity(), 4.0);
        assert_eq!(subset.capacity(), 6.0);

        let mut d = domain(2);
        subset.add(&mut d).unwrap();
        assert_eq!(subset.current_demand(), 2.0);
    }

    #[test]
    fn test_add_rejects_over_capacity_without_change() {
        let mut subset = cpu_subset(&[0, 1], 1.0);
        let mut d1 = domain(2);
        subset.add(&mut d1).unwrap();

        let mut d2 = domain(1);
        let err = subset.add(&mut d2).unwrap_err();
        assert_eq!(err.reason_code(), "capacity");
        assert_eq!(subset.hosted().count(), 1);
        assert!(!d2.is_pinned());
    }

    #[test]
    fn test_add_pins_floating_domain_to_all_cpus() {
        let mut subset = cpu_subset(&[2, 3], 1.0);
        let mut d = domain(2);
        subset.add(&mut d).unwrap();

        assert!(d.cpu_pin().iter().all(|p| *p == BTreeSet::from([2, 3])));
    }

    #[test]
    fn test_add_rejects_pin_outside_subset() {
        let mut subset = cpu_subset(&[0, 1], 1.0);
        let mut s = spec("vm", 1, 512, 1.0);
        s.cpu_pin = Some(vec![BTreeSet::from([5])]);
        let mut d = Domain::new(s).unwrap();

        assert!(matches!(
            subset.add(&mut d),
            Err(SubsetError::PinConflict { .. })
        ));
        assert!(subset.is_empty());
    }

    #[test]
    fn test_add_keeps_valid_explicit_pin() {
        let mut subset = cpu_subset(&[0, 1], 1.0);
        let mut s = spec("vm", 1, 512, 1.0);
        s.cpu_pin = Some(vec![BTreeSet::from([1])]);
        let mut d = Domain::new(s).unwrap();

        subset.add(&mut d).unwrap();
        assert_eq!(d.pinned_cpus(), BTreeSet::from([1]));
    }

    #[test]
    fn test_remove_is_idempotent_and_clears_pin() {
        let mut subset = cpu_subset(&[0, 1], 1.0);
        let mut d = domain(1);
        subset.add(&mut d).unwrap();

        assert!(subset.remove(&mut d));
        assert!(!d.is_pinned());
        assert!(!subset.remove(&mut d));
    }

    #[test]
    fn test_set_ratio_checks() {
        let mut subset = cpu_subset(&[0, 1, 2, 3], 1.5);
        let mut d1 = domain(4);
        let mut d2 = domain(2);
        subset.add(&mut d1).unwrap();
        subset.add(&mut d2).unwrap();

        assert_eq!(subset.ratio_floor(), 1.5);
        assert!(matches!(
            subset.set_oversubscription_ratio(0.5),
            Err(SubsetError::InvalidRatio(_))
        ));
        assert!(matches!(
            subset.set_oversubscription_ratio(1.2),
            Err(SubsetError::Capacity { .. })
        ));
        assert_eq!(subset.ratio(), 1.5);

        subset.set_oversubscription_ratio(2.0).unwrap();
        assert_eq!(subset.capacity(), 8.0);
    }

    #[test]
    fn test_resize_repins_auto_pinned_domains() {
        let mut subset = cpu_subset(&[0, 1], 1.0);
        let mut d = domain(2);
        subset.add(&mut d).unwrap();
        let uuid = d.uuid();
        let mut domains = HashMap::from([(uuid, d)]);

        let repinned = subset
            .resize(BTreeSet::from([0, 1, 2, 3]), &mut domains)
            .unwrap();
        assert_eq!(repinned, vec![uuid]);
        assert_eq!(domains[&uuid].pinned_cpus(), BTreeSet::from([0, 1, 2, 3]));
    }

    #[test]
    fn test_resize_rejects_shrink_below_demand() {
        let mut subset = cpu_subset(&[0, 1, 2, 3], 1.0);
        let mut d = domain(3);
        subset.add(&mut d).unwrap();
        let mut domains = HashMap::from([(d.uuid(), d)]);

        let err = subset
            .resize(BTreeSet::from([0, 1]), &mut domains)
            .unwrap_err();
        assert_eq!(err.reason_code(), "resize_rejected");
        assert_eq!(subset.units().len(), 4);
    }

    #[test]
    fn test_resize_rejects_stranding_explicit_pin() {
        let mut subset = cpu_subset(&[0, 1, 2, 3], 1.0);
        let mut s = spec("vm", 1, 512, 1.0);
        s.cpu_pin = Some(vec![BTreeSet::from([3])]);
        let mut d = Domain::new(s).unwrap();
        subset.add(&mut d).unwrap();
        let mut domains = HashMap::from([(d.uuid(), d)]);

        assert!(subset
            .resize(BTreeSet::from([0, 1]), &mut domains)
            .is_err());
    }
}
