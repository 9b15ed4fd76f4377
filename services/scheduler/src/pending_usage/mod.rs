//! Pending usage ledger.
//!
//! Resources handed out by a scheduling decision are reserved here until the
//! downstream system confirms them (completion notify), the hosts are
//! reloaded, or the reservation expires. Candidates subtract the pending
//! usage of their host when computing free resources, so two requests never
//! double-book the same slot in the window between decision and commit.

mod manager;
mod worker;

use std::collections::BTreeMap;

use hostsched_api::{HostPick, PendingUsageView, ScheduleInput};

pub use manager::{PendingUsageManager, SessionPendingUsage};
pub use worker::{PendingUsageGcConfig, PendingUsageGcWorker};

/// Tentatively consumed resources on one host.
///
/// Subtraction is clamped: no field ever drops below zero, and map entries
/// that reach zero are removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingUsage {
    pub host_id: String,
    /// Servers reserved on the host.
    pub servers: i64,
    pub cpu: i64,
    pub memory_mb: i64,
    pub isolated_devices: i64,
    /// Disk size per storage backend.
    pub disks: BTreeMap<String, i64>,
    /// Addresses per network.
    pub nets: BTreeMap<String, i64>,
    /// Guests per instance group.
    pub instance_groups: BTreeMap<String, i64>,
}

impl PendingUsage {
    pub fn new(host_id: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
            ..Default::default()
        }
    }

    /// Footprint of one server of `input` placed on `pick`.
    pub fn from_request(input: &ScheduleInput, pick: &HostPick) -> Self {
        let mut usage = Self::new(pick.id.clone());
        usage.servers = 1;
        usage.cpu = input.vcpu_count;
        usage.memory_mb = input.memory_mb;
        usage.isolated_devices = input.isolated_devices;
        usage.disks = input
            .disk_size_by_backend()
            .into_iter()
            .filter(|(_, size)| *size > 0)
            .collect();
        for net in &pick.network_ids {
            *usage.nets.entry(net.clone()).or_insert(0) += 1;
        }
        for group in &input.instance_group_ids {
            *usage.instance_groups.entry(group.clone()).or_insert(0) += 1;
        }
        usage
    }

    pub fn add(&mut self, other: &PendingUsage) {
        self.servers += other.servers;
        self.cpu += other.cpu;
        self.memory_mb += other.memory_mb;
        self.isolated_devices += other.isolated_devices;
        add_map(&mut self.disks, &other.disks);
        add_map(&mut self.nets, &other.nets);
        add_map(&mut self.instance_groups, &other.instance_groups);
    }

    pub fn sub(&mut self, other: &PendingUsage) {
        self.servers = (self.servers - other.servers).max(0);
        self.cpu = (self.cpu - other.cpu).max(0);
        self.memory_mb = (self.memory_mb - other.memory_mb).max(0);
        self.isolated_devices = (self.isolated_devices - other.isolated_devices).max(0);
        sub_map(&mut self.disks, &other.disks);
        sub_map(&mut self.nets, &other.nets);
        sub_map(&mut self.instance_groups, &other.instance_groups);
    }

    pub fn is_empty(&self) -> bool {
        self.servers == 0
            && self.cpu == 0
            && self.memory_mb == 0
            && self.isolated_devices == 0
            && self.disks.is_empty()
            && self.nets.is_empty()
            && self.instance_groups.is_empty()
    }

    pub fn disk(&self, backend: &str) -> i64 {
        self.disks.get(backend).copied().unwrap_or(0)
    }

    pub fn net(&self, network_id: &str) -> i64 {
        self.nets.get(network_id).copied().unwrap_or(0)
    }

    pub fn instance_group(&self, group_id: &str) -> i64 {
        self.instance_groups.get(group_id).copied().unwrap_or(0)
    }

    pub fn to_view(&self) -> PendingUsageView {
        PendingUsageView {
            cpu: self.cpu,
            memory_mb: self.memory_mb,
            isolated_devices: self.isolated_devices,
            disks: self.disks.clone(),
            nets: self.nets.clone(),
            instance_groups: self.instance_groups.clone(),
        }
    }
}

fn add_map(target: &mut BTreeMap<String, i64>, other: &BTreeMap<String, i64>) {
    for (key, value) in other {
        if *value == 0 {
            continue;
        }
        let entry = target.entry(key.clone()).or_insert(0);
        *entry += value;
        if *entry <= 0 {
            target.remove(key);
        }
    }
}

fn sub_map(target: &mut BTreeMap<String, i64>, other: &BTreeMap<String, i64>) {
    for (key, value) in other {
        if let Some(entry) = target.get_mut(key) {
            *entry -= value;
            if *entry <= 0 {
                target.remove(key);
            }
        }
    }
}
