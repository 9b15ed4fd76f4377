//! Schedulable resources.
//!
//! A [`Candidate`] is an immutable snapshot of one host or baremetal as last
//! loaded from the data source. The cache replaces whole candidates on
//! reload; nothing mutates a candidate in place.

mod getter;

use std::collections::BTreeMap;

use hostsched_api::{parse_range, ParseError, ResType};
use serde::{Deserialize, Serialize};

pub use getter::ResourceGetter;

/// Host status that accepts new guests.
pub const HOST_STATUS_RUNNING: &str = "running";

/// Baremetal status that accepts a server.
pub const BAREMETAL_STATUS_READY: &str = "ready";

/// Storage backend that baremetal disks map onto.
pub const BAREMETAL_DISK_BACKEND: &str = "local";

fn default_cmtbound() -> f64 {
    1.0
}

fn default_enabled() -> bool {
    true
}

fn default_host_status() -> String {
    HOST_STATUS_RUNNING.to_string()
}

fn default_baremetal_status() -> String {
    BAREMETAL_STATUS_READY.to_string()
}

fn default_host_type() -> String {
    "kvm".to_string()
}

// =============================================================================
// Descriptors
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageDesc {
    pub id: String,
    pub backend: String,
    pub capacity_mb: i64,
    #[serde(default)]
    pub used_mb: i64,
    /// Overcommit ratio.
    #[serde(default = "default_cmtbound")]
    pub cmtbound: f64,
}

impl StorageDesc {
    /// Usable size before pending usage.
    pub fn free_mb(&self) -> i64 {
        (self.capacity_mb as f64 * self.cmtbound).floor() as i64 - self.used_mb
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDesc {
    pub id: String,
    pub wire_id: String,
    #[serde(default)]
    pub free_addresses: i64,
}

/// A virtualization host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostDesc {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub zone_id: Option<String>,
    #[serde(default)]
    pub pool_id: Option<String>,
    #[serde(default)]
    pub region_id: Option<String>,
    /// Kubernetes node backed by this host, if any.
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default = "default_host_type")]
    pub host_type: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_host_status")]
    pub status: String,
    pub cpu_count: i64,
    /// Cores kept for the host itself, e.g. `"0-1"`.
    #[serde(default)]
    pub reserved_cpus: String,
    /// Core count of `reserved_cpus`, filled in by [`HostDesc::prepare`].
    #[serde(skip)]
    pub reserved_cpu_cores: i64,
    #[serde(default = "default_cmtbound")]
    pub cpu_cmtbound: f64,
    #[serde(default)]
    pub running_cpu: i64,
    pub mem_size_mb: i64,
    #[serde(default)]
    pub mem_reserved_mb: i64,
    #[serde(default = "default_cmtbound")]
    pub mem_cmtbound: f64,
    #[serde(default)]
    pub running_mem_mb: i64,
    #[serde(default)]
    pub storages: Vec<StorageDesc>,
    #[serde(default)]
    pub networks: Vec<NetworkDesc>,
    #[serde(default)]
    pub isolated_devices_free: i64,
    #[serde(default)]
    pub schedtags: Vec<String>,
    /// Guests per instance group already running on the host.
    #[serde(default)]
    pub instance_group_guests: BTreeMap<String, i64>,
}

impl HostDesc {
    /// Parse derived fields once, before the host is cached.
    pub fn prepare(&mut self) -> Result<(), ParseError> {
        self.reserved_cpu_cores = parse_range(&self.reserved_cpus)?.len() as i64;
        Ok(())
    }

    pub fn reserved_cpu_count(&self) -> i64 {
        self.reserved_cpu_cores
    }
}

/// A whole physical machine handed out to exactly one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaremetalDesc {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub zone_id: Option<String>,
    #[serde(default)]
    pub pool_id: Option<String>,
    #[serde(default)]
    pub region_id: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_baremetal_status")]
    pub status: String,
    /// A server already runs on the machine.
    #[serde(default)]
    pub allocated: bool,
    pub cpu_count: i64,
    pub mem_size_mb: i64,
    #[serde(default)]
    pub storage_size_mb: i64,
    #[serde(default)]
    pub networks: Vec<NetworkDesc>,
    #[serde(default)]
    pub schedtags: Vec<String>,
}

/// An affinity/anti-affinity rule across hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceGroup {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Max guests of the group on one host.
    pub granularity: i64,
    /// Whether exceeding `granularity` excludes a host outright.
    #[serde(default)]
    pub force_dispersion: bool,
}

// =============================================================================
// Candidate
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Candidate {
    Host(HostDesc),
    Baremetal(BaremetalDesc),
}

impl Candidate {
    pub fn id(&self) -> &str {
        match self {
            Candidate::Host(h) => &h.id,
            Candidate::Baremetal(b) => &b.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Candidate::Host(h) => &h.name,
            Candidate::Baremetal(b) => &b.name,
        }
    }

    pub fn res_type(&self) -> ResType {
        match self {
            Candidate::Host(_) => ResType::Host,
            Candidate::Baremetal(_) => ResType::Baremetal,
        }
    }

    pub fn zone_id(&self) -> Option<&str> {
        match self {
            Candidate::Host(h) => h.zone_id.as_deref(),
            Candidate::Baremetal(b) => b.zone_id.as_deref(),
        }
    }

    pub fn pool_id(&self) -> Option<&str> {
        match self {
            Candidate::Host(h) => h.pool_id.as_deref(),
            Candidate::Baremetal(b) => b.pool_id.as_deref(),
        }
    }

    pub fn region_id(&self) -> Option<&str> {
        match self {
            Candidate::Host(h) => h.region_id.as_deref(),
            Candidate::Baremetal(b) => b.region_id.as_deref(),
        }
    }

    pub fn status(&self) -> &str {
        match self {
            Candidate::Host(h) => &h.status,
            Candidate::Baremetal(b) => &b.status,
        }
    }

    pub fn host_type(&self) -> &str {
        match self {
            Candidate::Host(h) => &h.host_type,
            Candidate::Baremetal(_) => "baremetal",
        }
    }

    pub fn node_name(&self) -> Option<&str> {
        match self {
            Candidate::Host(h) => h.node_name.as_deref(),
            Candidate::Baremetal(_) => None,
        }
    }

    pub fn networks(&self) -> &[NetworkDesc] {
        match self {
            Candidate::Host(h) => &h.networks,
            Candidate::Baremetal(b) => &b.networks,
        }
    }

    pub fn storages(&self) -> &[StorageDesc] {
        match self {
            Candidate::Host(h) => &h.storages,
            Candidate::Baremetal(_) => &[],
        }
    }

    pub fn schedtags(&self) -> &[String] {
        match self {
            Candidate::Host(h) => &h.schedtags,
            Candidate::Baremetal(b) => &b.schedtags,
        }
    }

    pub fn has_schedtag(&self, tag: &str) -> bool {
        self.schedtags().iter().any(|t| t == tag)
    }

    /// Wires this candidate is attached to, in network order without repeats.
    pub fn wire_ids(&self) -> Vec<&str> {
        let mut wires: Vec<&str> = Vec::new();
        for net in self.networks() {
            if !wires.contains(&net.wire_id.as_str()) {
                wires.push(&net.wire_id);
            }
        }
        wires
    }

    pub fn on_wire(&self, wire_id: &str) -> bool {
        self.networks().iter().any(|n| n.wire_id == wire_id)
    }

    /// Guests of an instance group already on this candidate.
    pub fn instance_group_guests(&self, group_id: &str) -> i64 {
        match self {
            Candidate::Host(h) => h.instance_group_guests.get(group_id).copied().unwrap_or(0),
            Candidate::Baremetal(b) => i64::from(b.allocated),
        }
    }

    /// Whether the candidate accepts new placements at all.
    pub fn is_schedulable(&self) -> bool {
        match self {
            Candidate::Host(h) => h.enabled && h.status == HOST_STATUS_RUNNING,
            Candidate::Baremetal(b) => {
                b.enabled && b.status == BAREMETAL_STATUS_READY && !b.allocated
            }
        }
    }

    /// Parse fields that need it before the candidate is cached.
    pub fn prepare(&mut self) -> Result<(), ParseError> {
        match self {
            Candidate::Host(h) => h.prepare(),
            Candidate::Baremetal(_) => Ok(()),
        }
    }
}

impl From<HostDesc> for Candidate {
    fn from(value: HostDesc) -> Self {
        Candidate::Host(value)
    }
}

impl From<BaremetalDesc> for Candidate {
    fn from(value: BaremetalDesc) -> Self {
        Candidate::Baremetal(value)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_host_defaults_from_json() {
        let h: HostDesc = serde_json::from_str(
            r#"{"id": "h1", "name": "host-1", "cpu_count": 16, "mem_size_mb": 65536}"#,
        )
        .unwrap();
        assert!(h.enabled);
        assert_eq!(h.status, HOST_STATUS_RUNNING);
        assert_eq!(h.host_type, "kvm");
        assert_eq!(h.cpu_cmtbound, 1.0);
    }

    #[test]
    fn test_reserved_cpu_count() {
        let mut h = host("h1", 16, 1024);
        h.reserved_cpus = "0-1, 4".to_string();
        assert_eq!(h.reserved_cpu_count(), 0);
        h.prepare().unwrap();
        assert_eq!(h.reserved_cpu_count(), 3);

        h.reserved_cpus = "1-".to_string();
        assert!(Candidate::from(h.clone()).prepare().is_err());

        h.reserved_cpus = "0-20000000".to_string();
        assert!(Candidate::from(h).prepare().is_err());
    }

    #[test]
    fn test_wire_ids_deduplicated() {
        let mut h = host("h1", 16, 1024);
        h.networks.push(NetworkDesc {
            id: "net2".into(),
            wire_id: "wire1".into(),
            free_addresses: 1,
        });
        h.networks.push(NetworkDesc {
            id: "net3".into(),
            wire_id: "wire2".into(),
            free_addresses: 1,
        });
        assert_eq!(Candidate::from(h).wire_ids(), vec!["wire1", "wire2"]);
    }

    #[test]
    fn test_schedulable() {
        let mut h = host("h1", 16, 1024);
        assert!(Candidate::from(h.clone()).is_schedulable());
        h.status = "offline".into();
        assert!(!Candidate::from(h).is_schedulable());

        let mut b = baremetal("b1");
        assert!(Candidate::from(b.clone()).is_schedulable());
        b.allocated = true;
        let c = Candidate::from(b);
        assert!(!c.is_schedulable());
        assert_eq!(c.host_type(), "baremetal");
        assert_eq!(c.res_type(), ResType::Baremetal);
    }
}
