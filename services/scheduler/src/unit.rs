//! Per-task scheduling context.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use hostsched_api::{ForecastFilter, NetworkSpec, ScheduleInput};
use parking_lot::Mutex;

use crate::candidate::{Candidate, InstanceGroup, NetworkDesc, ResourceGetter};
use crate::pending_usage::{PendingUsage, PendingUsageManager};

/// The first requested NIC that could not get an address, by index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NicShortfall {
    NoNetwork(usize),
    OutOfAddresses(usize),
}

fn nic_matches(nic: &NetworkSpec, net: &NetworkDesc) -> bool {
    match (&nic.network_id, &nic.wire_id) {
        (Some(id), _) => &net.id == id,
        (None, Some(wire)) => &net.wire_id == wire,
        (None, None) => true,
    }
}

/// Why one candidate was dropped by one predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterLog {
    pub candidate_id: String,
    pub predicate: String,
    pub reason: String,
}

/// Collects predicate failures of a task for forecasts and diagnostics.
#[derive(Debug, Default)]
pub struct LogManager {
    entries: Mutex<Vec<FilterLog>>,
}

impl LogManager {
    pub fn append(&self, candidate_id: &str, predicate: &str, reason: impl Into<String>) {
        self.entries.lock().push(FilterLog {
            candidate_id: candidate_id.to_string(),
            predicate: predicate.to_string(),
            reason: reason.into(),
        });
    }

    pub fn extend(&self, logs: Vec<FilterLog>) {
        self.entries.lock().extend(logs);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn drain(&self) -> Vec<FilterLog> {
        std::mem::take(&mut *self.entries.lock())
    }

    /// Failures grouped by (predicate, reason), counting candidates.
    pub fn aggregate(&self) -> Vec<ForecastFilter> {
        let mut grouped: BTreeMap<(String, String), usize> = BTreeMap::new();
        for log in self.entries.lock().iter() {
            *grouped
                .entry((log.predicate.clone(), log.reason.clone()))
                .or_insert(0) += 1;
        }
        grouped
            .into_iter()
            .map(|((predicate, reason), count)| ForecastFilter {
                predicate,
                reason,
                count,
            })
            .collect()
    }
}

/// The request plus the ledger state it is scheduled against.
///
/// Pending usage is snapshotted when the unit is built, so every predicate
/// of one task sees the same reservations.
#[derive(Debug)]
pub struct Unit {
    pub task_id: String,
    pub input: Arc<ScheduleInput>,
    pending: HashMap<String, PendingUsage>,
    net_pending: HashMap<String, i64>,
    instance_groups: Vec<InstanceGroup>,
    pub log: LogManager,
}

impl Unit {
    pub fn new(
        task_id: impl Into<String>,
        input: Arc<ScheduleInput>,
        ledger: &PendingUsageManager,
        candidates: &[Arc<Candidate>],
        instance_groups: Vec<InstanceGroup>,
    ) -> Self {
        let mut pending = HashMap::new();
        let mut net_pending = HashMap::new();
        for candidate in candidates {
            if let Some(usage) = ledger.get_pending_usage(candidate.id()) {
                pending.insert(candidate.id().to_string(), usage);
            }
            for net in candidate.networks() {
                net_pending
                    .entry(net.id.clone())
                    .or_insert_with(|| ledger.get_net_pending_usage(&net.id));
            }
        }

        Self {
            task_id: task_id.into(),
            input,
            pending,
            net_pending,
            instance_groups,
            log: LogManager::default(),
        }
    }

    pub fn pending(&self, host_id: &str) -> Option<&PendingUsage> {
        self.pending.get(host_id)
    }

    pub fn net_pending(&self, network_id: &str) -> i64 {
        self.net_pending.get(network_id).copied().unwrap_or(0)
    }

    pub fn getter<'a>(&'a self, candidate: &'a Candidate) -> ResourceGetter<'a> {
        candidate.getter(self.pending(candidate.id()))
    }

    /// Give every requested NIC a network on `candidate`, one address each.
    /// NICs landing on the same network draw from the same free pool.
    pub fn assign_networks(&self, candidate: &Candidate) -> Result<Vec<String>, NicShortfall> {
        let getter = self.getter(candidate);
        let mut taken: HashMap<&str, i64> = HashMap::new();
        let mut assigned = Vec::with_capacity(self.input.networks.len());

        for (idx, nic) in self.input.networks.iter().enumerate() {
            let best = candidate
                .networks()
                .iter()
                .filter(|net| nic_matches(nic, net))
                .filter_map(|net| {
                    let free = getter.free_addresses(&net.id, self.net_pending(&net.id))?;
                    Some((free - taken.get(net.id.as_str()).copied().unwrap_or(0), net))
                })
                .max_by_key(|(free, net)| (*free, Reverse(net.id.as_str())));

            match best {
                None => return Err(NicShortfall::NoNetwork(idx)),
                Some((free, _)) if free < 1 => return Err(NicShortfall::OutOfAddresses(idx)),
                Some((_, net)) => {
                    *taken.entry(net.id.as_str()).or_insert(0) += 1;
                    assigned.push(net.id.clone());
                }
            }
        }
        Ok(assigned)
    }

    pub fn instance_groups(&self) -> &[InstanceGroup] {
        &self.instance_groups
    }

    pub fn instance_group(&self, id: &str) -> Option<&InstanceGroup> {
        self.instance_groups.iter().find(|g| g.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::testing::host;
    use hostsched_api::{CandidateResource, HostPick, ResType};

    #[test]
    fn test_log_aggregate() {
        let log = LogManager::default();
        log.append("h1", "cpu", "no enough cpu");
        log.append("h2", "cpu", "no enough cpu");
        log.append("h3", "memory", "no enough memory");

        let agg = log.aggregate();
        assert_eq!(agg.len(), 2);
        assert_eq!(agg[0].predicate, "cpu");
        assert_eq!(agg[0].count, 2);

        assert_eq!(log.drain().len(), 3);
        assert!(log.is_empty());
    }

    #[test]
    fn test_unit_snapshots_pending() {
        let ledger = PendingUsageManager::new();
        let input = ScheduleInput {
            vcpu_count: 2,
            memory_mb: 512,
            ..Default::default()
        };
        ledger.add_pending_usage(
            &input,
            &CandidateResource {
                session_id: "s1".into(),
                host: HostPick {
                    id: "h1".into(),
                    name: "h1".into(),
                    res_type: ResType::Host,
                    zone_id: None,
                    storage_ids: vec![],
                    network_ids: vec!["net1".into()],
                },
                backup: None,
            },
        );

        let candidate = Arc::new(Candidate::from(host("h1", 8, 4096)));
        let unit = Unit::new("t1", Arc::new(input), &ledger, &[candidate.clone()], vec![]);
        assert_eq!(unit.pending("h1").unwrap().cpu, 2);
        assert_eq!(unit.net_pending("net1"), 1);
        assert_eq!(unit.getter(&candidate).free_cpu(), 6);
    }

    #[test]
    fn test_nics_on_one_network_share_its_addresses() {
        let nic = || NetworkSpec {
            network_id: Some("net1".into()),
            wire_id: None,
        };
        let input = ScheduleInput {
            networks: vec![nic(), nic()],
            ..Default::default()
        };
        let unit = Unit::new("t1", Arc::new(input), &PendingUsageManager::new(), &[], vec![]);

        let mut h = host("h1", 8, 4096);
        h.networks[0].free_addresses = 2;
        let both = unit.assign_networks(&h.clone().into()).unwrap();
        assert_eq!(both, vec!["net1".to_string(), "net1".to_string()]);

        h.networks[0].free_addresses = 1;
        assert_eq!(
            unit.assign_networks(&h.into()),
            Err(NicShortfall::OutOfAddresses(1))
        );
    }
}
