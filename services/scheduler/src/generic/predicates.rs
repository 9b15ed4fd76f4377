//! Hard filters.
//!
//! Each predicate either rejects a candidate with a reason or lets it through,
//! optionally bounding how many servers of the requested shape it can take.

use std::collections::BTreeMap;

use hostsched_api::{Hypervisor, SchedtagStrategy};

use crate::candidate::{Candidate, BAREMETAL_DISK_BACKEND};
use crate::error::SchedError;
use crate::unit::{NicShortfall, Unit};

/// Outcome of one predicate on one candidate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PredicateResult {
    pub fits: bool,
    pub reasons: Vec<String>,
    /// Servers this predicate allows; `None` when it does not bound capacity.
    pub capacity: Option<i64>,
    pub group_capacity: BTreeMap<String, i64>,
}

impl PredicateResult {
    pub fn fit() -> Self {
        Self {
            fits: true,
            ..Default::default()
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            fits: false,
            reasons: vec![reason.into()],
            ..Default::default()
        }
    }

    pub fn with_capacity(mut self, capacity: i64) -> Self {
        self.capacity = Some(capacity);
        self
    }
}

pub trait FitPredicate: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the predicate has anything to check for this request.
    fn applies(&self, _unit: &Unit) -> bool {
        true
    }

    fn check(&self, unit: &Unit, candidate: &Candidate) -> Result<PredicateResult, SchedError>;
}

/// Predicates in evaluation order.
pub fn default_predicates() -> Vec<Box<dyn FitPredicate>> {
    vec![
        Box::new(StatusPredicate),
        Box::new(HypervisorPredicate),
        Box::new(SchedtagPredicate),
        Box::new(CpuPredicate),
        Box::new(MemoryPredicate),
        Box::new(StoragePredicate),
        Box::new(NetworkPredicate),
        Box::new(IsolatedDevicePredicate),
        Box::new(InstanceGroupPredicate),
    ]
}

/// `free / request` for a host; a fitting baremetal always holds exactly one.
fn slots(candidate: &Candidate, free: i64, request: i64) -> i64 {
    match candidate {
        Candidate::Host(_) => free / request,
        Candidate::Baremetal(_) => 1,
    }
}

// =============================================================================
// Status / Hypervisor / Schedtag
// =============================================================================

pub struct StatusPredicate;

impl FitPredicate for StatusPredicate {
    fn name(&self) -> &'static str {
        "status"
    }

    fn check(&self, unit: &Unit, candidate: &Candidate) -> Result<PredicateResult, SchedError> {
        if !candidate.is_schedulable() {
            return Ok(PredicateResult::fail(format!(
                "{} is not schedulable (status {})",
                candidate.res_type(),
                candidate.status()
            )));
        }
        if let Candidate::Baremetal(_) = candidate {
            if unit.pending(candidate.id()).is_some_and(|p| p.servers > 0) {
                return Ok(PredicateResult::fail("baremetal is reserved by a pending server"));
            }
        }
        Ok(PredicateResult::fit())
    }
}

pub struct HypervisorPredicate;

impl FitPredicate for HypervisorPredicate {
    fn name(&self) -> &'static str {
        "hypervisor"
    }

    fn check(&self, unit: &Unit, candidate: &Candidate) -> Result<PredicateResult, SchedError> {
        let wanted = unit.input.hypervisor;
        let fits = match (candidate, wanted) {
            (_, Hypervisor::Any) => true,
            (Candidate::Baremetal(_), Hypervisor::Baremetal) => true,
            (Candidate::Baremetal(_), _) => false,
            (Candidate::Host(h), _) => wanted.host_type() == Some(h.host_type.as_str()),
        };
        Ok(if fits {
            PredicateResult::fit()
        } else {
            PredicateResult::fail(format!(
                "host type {} does not serve hypervisor {:?}",
                candidate.host_type(),
                wanted
            ))
        })
    }
}

pub struct SchedtagPredicate;

impl FitPredicate for SchedtagPredicate {
    fn name(&self) -> &'static str {
        "schedtag"
    }

    fn applies(&self, unit: &Unit) -> bool {
        unit.input.schedtags.iter().any(|t| t.strategy.is_hard())
    }

    fn check(&self, unit: &Unit, candidate: &Candidate) -> Result<PredicateResult, SchedError> {
        for tag in &unit.input.schedtags {
            let has = candidate.has_schedtag(&tag.id);
            match tag.strategy {
                SchedtagStrategy::Require if !has => {
                    return Ok(PredicateResult::fail(format!("missing required schedtag {}", tag.id)));
                }
                SchedtagStrategy::Exclude if has => {
                    return Ok(PredicateResult::fail(format!("carries excluded schedtag {}", tag.id)));
                }
                _ => {}
            }
        }
        Ok(PredicateResult::fit())
    }
}

// =============================================================================
// Compute
// =============================================================================

pub struct CpuPredicate;

impl FitPredicate for CpuPredicate {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn applies(&self, unit: &Unit) -> bool {
        unit.input.vcpu_count > 0
    }

    fn check(&self, unit: &Unit, candidate: &Candidate) -> Result<PredicateResult, SchedError> {
        let request = unit.input.vcpu_count;
        let free = unit.getter(candidate).free_cpu();
        if free < request {
            return Ok(PredicateResult::fail(format!(
                "no enough cpu: free {free}, request {request}"
            )));
        }
        Ok(PredicateResult::fit().with_capacity(slots(candidate, free, request)))
    }
}

pub struct MemoryPredicate;

impl FitPredicate for MemoryPredicate {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn applies(&self, unit: &Unit) -> bool {
        unit.input.memory_mb > 0
    }

    fn check(&self, unit: &Unit, candidate: &Candidate) -> Result<PredicateResult, SchedError> {
        let request = unit.input.memory_mb;
        let free = unit.getter(candidate).free_memory_mb();
        if free < request {
            return Ok(PredicateResult::fail(format!(
                "no enough memory: free {free}MB, request {request}MB"
            )));
        }
        Ok(PredicateResult::fit().with_capacity(slots(candidate, free, request)))
    }
}

pub struct StoragePredicate;

impl FitPredicate for StoragePredicate {
    fn name(&self) -> &'static str {
        "storage"
    }

    fn applies(&self, unit: &Unit) -> bool {
        unit.input.disks.iter().any(|d| d.size_mb > 0)
    }

    fn check(&self, unit: &Unit, candidate: &Candidate) -> Result<PredicateResult, SchedError> {
        let getter = unit.getter(candidate);
        let mut capacity = i64::MAX;

        for (backend, request) in unit.input.disk_size_by_backend() {
            if request <= 0 {
                continue;
            }
            if let Candidate::Baremetal(_) = candidate {
                if backend != BAREMETAL_DISK_BACKEND {
                    return Ok(PredicateResult::fail(format!(
                        "baremetal has no {backend} storage"
                    )));
                }
            }
            let free = getter.free_storage_mb(&backend);
            if free < request {
                return Ok(PredicateResult::fail(format!(
                    "no enough {backend} storage: free {free}MB, request {request}MB"
                )));
            }
            capacity = capacity.min(slots(candidate, free, request));
        }

        Ok(PredicateResult::fit().with_capacity(capacity))
    }
}

// =============================================================================
// Network / Devices
// =============================================================================

pub struct NetworkPredicate;

impl FitPredicate for NetworkPredicate {
    fn name(&self) -> &'static str {
        "network"
    }

    fn applies(&self, unit: &Unit) -> bool {
        !unit.input.networks.is_empty()
    }

    fn check(&self, unit: &Unit, candidate: &Candidate) -> Result<PredicateResult, SchedError> {
        let assigned = match unit.assign_networks(candidate) {
            Ok(assigned) => assigned,
            Err(NicShortfall::NoNetwork(idx)) => {
                return Ok(PredicateResult::fail(format!(
                    "nic {idx}: no matching network attached"
                )))
            }
            Err(NicShortfall::OutOfAddresses(idx)) => {
                return Ok(PredicateResult::fail(format!(
                    "nic {idx}: network out of addresses"
                )))
            }
        };

        let mut need: BTreeMap<&str, i64> = BTreeMap::new();
        for net in &assigned {
            *need.entry(net.as_str()).or_insert(0) += 1;
        }

        let getter = unit.getter(candidate);
        let capacity = need
            .iter()
            .map(|(net, need)| {
                let free = getter.free_addresses(net, unit.net_pending(net)).unwrap_or(0);
                slots(candidate, free, *need)
            })
            .min()
            .unwrap_or(i64::MAX);

        Ok(PredicateResult::fit().with_capacity(capacity))
    }
}

pub struct IsolatedDevicePredicate;

impl FitPredicate for IsolatedDevicePredicate {
    fn name(&self) -> &'static str {
        "isolated_device"
    }

    fn applies(&self, unit: &Unit) -> bool {
        unit.input.isolated_devices > 0
    }

    fn check(&self, unit: &Unit, candidate: &Candidate) -> Result<PredicateResult, SchedError> {
        match candidate {
            Candidate::Baremetal(_) => Ok(PredicateResult::fit()),
            Candidate::Host(_) => {
                let request = unit.input.isolated_devices;
                let free = unit.getter(candidate).free_isolated_devices();
                if free < request {
                    return Ok(PredicateResult::fail(format!(
                        "no enough isolated devices: free {free}, request {request}"
                    )));
                }
                Ok(PredicateResult::fit().with_capacity(free / request))
            }
        }
    }
}

// =============================================================================
// Instance groups
// =============================================================================

pub struct InstanceGroupPredicate;

impl FitPredicate for InstanceGroupPredicate {
    fn name(&self) -> &'static str {
        "instance_group"
    }

    fn applies(&self, unit: &Unit) -> bool {
        !unit.input.instance_group_ids.is_empty()
    }

    fn check(&self, unit: &Unit, candidate: &Candidate) -> Result<PredicateResult, SchedError> {
        let getter = unit.getter(candidate);
        let mut result = PredicateResult::fit();

        for group_id in &unit.input.instance_group_ids {
            let Some(group) = unit.instance_group(group_id) else {
                return Err(SchedError::InvalidInput(format!(
                    "instance group {group_id} not found"
                )));
            };
            let remaining = group.granularity - getter.instance_group_guests(&group.id);
            if remaining <= 0 && group.force_dispersion {
                return Ok(PredicateResult::fail(format!(
                    "instance group {} already has {} guests here",
                    group.id, group.granularity
                )));
            }
            result.group_capacity.insert(group.id.clone(), remaining.max(0));
        }

        Ok(result)
    }
}
