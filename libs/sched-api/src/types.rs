//! Request and response types exchanged with the scheduler.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ParseError;
use crate::parse::parse_schedtag_config;

// =============================================================================
// Enums
// =============================================================================

/// Kind of schedulable resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResType {
    Host,
    Baremetal,
}

impl ResType {
    pub const ALL: [ResType; 2] = [ResType::Host, ResType::Baremetal];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResType::Host => "host",
            ResType::Baremetal => "baremetal",
        }
    }
}

impl fmt::Display for ResType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested hypervisor.
///
/// `Any` lets the scheduler consider virtualization hosts and baremetals in
/// the same request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hypervisor {
    #[default]
    Kvm,
    Esxi,
    Baremetal,
    Any,
}

impl Hypervisor {
    /// Resource types that must be searched for this hypervisor.
    pub fn res_types(&self) -> Vec<ResType> {
        match self {
            Hypervisor::Kvm | Hypervisor::Esxi => vec![ResType::Host],
            Hypervisor::Baremetal => vec![ResType::Baremetal],
            Hypervisor::Any => vec![ResType::Host, ResType::Baremetal],
        }
    }

    /// The host type string a virtualization host must carry, if any.
    pub fn host_type(&self) -> Option<&'static str> {
        match self {
            Hypervisor::Kvm => Some("kvm"),
            Hypervisor::Esxi => Some("esxi"),
            Hypervisor::Baremetal | Hypervisor::Any => None,
        }
    }
}

/// How a schedtag constrains placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedtagStrategy {
    /// Candidate must carry the tag.
    Require,
    /// Candidate must not carry the tag.
    Exclude,
    /// Candidates carrying the tag rank higher.
    Prefer,
    /// Candidates carrying the tag rank lower.
    Avoid,
}

impl SchedtagStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedtagStrategy::Require => "require",
            SchedtagStrategy::Exclude => "exclude",
            SchedtagStrategy::Prefer => "prefer",
            SchedtagStrategy::Avoid => "avoid",
        }
    }

    /// Hard strategies filter, soft strategies rank.
    pub fn is_hard(&self) -> bool {
        matches!(self, SchedtagStrategy::Require | SchedtagStrategy::Exclude)
    }
}

impl FromStr for SchedtagStrategy {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "require" => Ok(SchedtagStrategy::Require),
            "exclude" => Ok(SchedtagStrategy::Exclude),
            "prefer" => Ok(SchedtagStrategy::Prefer),
            "avoid" => Ok(SchedtagStrategy::Avoid),
            other => Err(ParseError::UnknownStrategy {
                strategy: other.to_string(),
            }),
        }
    }
}

/// A schedtag reference with its strategy, written as `<id>:<strategy>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SchedtagConfig {
    pub id: String,
    pub strategy: SchedtagStrategy,
}

impl fmt::Display for SchedtagConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.strategy.as_str())
    }
}

impl FromStr for SchedtagConfig {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_schedtag_config(s)
    }
}

impl TryFrom<String> for SchedtagConfig {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        parse_schedtag_config(&value)
    }
}

impl From<SchedtagConfig> for String {
    fn from(value: SchedtagConfig) -> Self {
        value.to_string()
    }
}

// =============================================================================
// Schedule Request
// =============================================================================

/// A requested disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSpec {
    /// Storage backend, e.g. `local` or `rbd`.
    pub backend: String,
    pub size_mb: i64,
}

/// A requested network interface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// Exact network to attach to.
    #[serde(default)]
    pub network_id: Option<String>,
    /// Any network on this wire is acceptable.
    #[serde(default)]
    pub wire_id: Option<String>,
}

fn default_count() -> i64 {
    1
}

/// A normalized scheduling request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleInput {
    /// Groups related decisions; generated when absent.
    #[serde(default)]
    pub session_id: Option<String>,

    /// Number of servers to place.
    #[serde(default = "default_count")]
    pub count: i64,

    /// Place each server as a master/backup pair.
    #[serde(default)]
    pub backup: bool,

    #[serde(default)]
    pub hypervisor: Hypervisor,

    #[serde(default)]
    pub vcpu_count: i64,

    #[serde(default)]
    pub memory_mb: i64,

    #[serde(default)]
    pub disks: Vec<DiskSpec>,

    #[serde(default)]
    pub networks: Vec<NetworkSpec>,

    /// Number of isolated (passthrough) devices per server.
    #[serde(default)]
    pub isolated_devices: i64,

    #[serde(default)]
    pub zone_id: Option<String>,

    #[serde(default)]
    pub pool_id: Option<String>,

    #[serde(default)]
    pub region_id: Option<String>,

    #[serde(default)]
    pub prefer_host: Option<String>,

    #[serde(default)]
    pub prefer_backup_host: Option<String>,

    #[serde(default)]
    pub instance_group_ids: Vec<String>,

    #[serde(default)]
    pub schedtags: Vec<SchedtagConfig>,

    /// Predicate names to skip.
    #[serde(default)]
    pub ignore_filters: BTreeSet<String>,

    /// Compute a placement without reserving anything.
    #[serde(default)]
    pub suggestion: bool,
}

impl Default for ScheduleInput {
    fn default() -> Self {
        Self {
            session_id: None,
            count: 1,
            backup: false,
            hypervisor: Hypervisor::default(),
            vcpu_count: 0,
            memory_mb: 0,
            disks: Vec::new(),
            networks: Vec::new(),
            isolated_devices: 0,
            zone_id: None,
            pool_id: None,
            region_id: None,
            prefer_host: None,
            prefer_backup_host: None,
            instance_group_ids: Vec::new(),
            schedtags: Vec::new(),
            ignore_filters: BTreeSet::new(),
            suggestion: false,
        }
    }
}

impl ScheduleInput {
    /// Total requested disk size per backend.
    pub fn disk_size_by_backend(&self) -> BTreeMap<String, i64> {
        let mut sizes = BTreeMap::new();
        for disk in &self.disks {
            *sizes.entry(disk.backend.clone()).or_insert(0) += disk.size_mb;
        }
        sizes
    }

    /// Whether a predicate has been switched off for this request.
    pub fn is_ignored(&self, predicate: &str) -> bool {
        self.ignore_filters.contains(predicate)
    }

    /// Session id, or an empty string when none was assigned.
    pub fn session(&self) -> &str {
        self.session_id.as_deref().unwrap_or_default()
    }
}

// =============================================================================
// Schedule Response
// =============================================================================

/// One host chosen for one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPick {
    pub id: String,
    pub name: String,
    pub res_type: ResType,
    #[serde(default)]
    pub zone_id: Option<String>,
    /// Storage chosen for each requested disk, in request order.
    #[serde(default)]
    pub storage_ids: Vec<String>,
    /// Network chosen for each requested NIC, in request order.
    #[serde(default)]
    pub network_ids: Vec<String>,
}

/// A successful placement for one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateResource {
    pub session_id: String,
    #[serde(flatten)]
    pub host: HostPick,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<HostPick>,
}

impl CandidateResource {
    /// The primary pick followed by the backup pick, if any.
    pub fn picks(&self) -> impl Iterator<Item = &HostPick> {
        std::iter::once(&self.host).chain(self.backup.iter())
    }
}

/// One entry of a schedule response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScheduleResultEntry {
    Candidate(CandidateResource),
    Error { error: String },
}

impl ScheduleResultEntry {
    pub fn error(message: impl Into<String>) -> Self {
        ScheduleResultEntry::Error {
            error: message.into(),
        }
    }

    pub fn candidate(&self) -> Option<&CandidateResource> {
        match self {
            ScheduleResultEntry::Candidate(c) => Some(c),
            ScheduleResultEntry::Error { .. } => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ScheduleResultEntry::Error { .. })
    }
}

/// Response of a schedule call. Always holds exactly `count` entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleOutput {
    pub task_id: String,
    pub session_id: String,
    pub candidates: Vec<ScheduleResultEntry>,
}

impl ScheduleOutput {
    pub fn success_count(&self) -> usize {
        self.candidates.iter().filter(|c| !c.is_error()).count()
    }
}

// =============================================================================
// Forecast
// =============================================================================

/// Capacity of one candidate as seen by a forecast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForecastCandidate {
    pub id: String,
    pub name: String,
    pub capacity: i64,
    pub score: i64,
    pub capacity_details: BTreeMap<String, i64>,
}

/// Aggregated filter failures of a forecast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForecastFilter {
    pub predicate: String,
    pub reason: String,
    pub count: usize,
}

/// Result of a forecast: how many servers of this shape would fit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForecastResult {
    pub can_create: bool,
    pub req_count: i64,
    pub allow_count: i64,
    pub candidates: Vec<ForecastCandidate>,
    pub filtered: Vec<ForecastFilter>,
}

// =============================================================================
// Expire / Completion / Cleanup
// =============================================================================

/// Hosts whose cached state is stale after a decision or cancellation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpireArgs {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub dirty_hosts: Vec<String>,
    #[serde(default)]
    pub dirty_baremetals: Vec<String>,
}

impl ExpireArgs {
    pub fn ids(&self, res_type: ResType) -> &[String] {
        match res_type {
            ResType::Host => &self.dirty_hosts,
            ResType::Baremetal => &self.dirty_baremetals,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.dirty_hosts.is_empty() && self.dirty_baremetals.is_empty()
    }
}

/// Expire request body: the args plus whether to wait for the flush.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpireRequest {
    #[serde(flatten)]
    pub args: ExpireArgs,
    #[serde(default)]
    pub trigger: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpireResult {
    /// False when the expire queue was full and the args were dropped.
    pub queued: bool,
    /// True when the caller waited for the batch to flush.
    pub flushed: bool,
}

/// The downstream system finished a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedNotifyArgs {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedNotifyResult {
    pub session_id: String,
    /// Hosts scheduled for reload-then-cancel.
    pub hosts: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupArgs {
    /// Limit the cleanup to one resource type; both when absent.
    #[serde(default)]
    pub res_type: Option<ResType>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupResult {
    pub reloaded: usize,
    pub sessions_cleared: usize,
}

// =============================================================================
// Candidate Views
// =============================================================================

/// Pending (reserved but unconfirmed) usage on one host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUsageView {
    pub cpu: i64,
    pub memory_mb: i64,
    pub isolated_devices: i64,
    pub disks: BTreeMap<String, i64>,
    pub nets: BTreeMap<String, i64>,
    pub instance_groups: BTreeMap<String, i64>,
}

/// Listing entry for one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateSummary {
    pub id: String,
    pub name: String,
    pub res_type: ResType,
    pub zone_id: Option<String>,
    pub pool_id: Option<String>,
    pub host_type: String,
    pub status: String,
    pub free_cpu: i64,
    pub free_memory_mb: i64,
    pub free_storage_mb: i64,
    pub pending: PendingUsageView,
    pub dirty: u64,
}

/// A page of candidate summaries, ordered by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateList {
    pub total: usize,
    pub offset: usize,
    pub items: Vec<CandidateSummary>,
}

/// Free space of one storage attached to a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageView {
    pub id: String,
    pub backend: String,
    pub capacity_mb: i64,
    pub free_mb: i64,
}

/// Free addresses of one network attached to a candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkView {
    pub id: String,
    pub wire_id: String,
    pub free_addresses: i64,
    pub pending: i64,
}

/// Full view of one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateDetail {
    #[serde(flatten)]
    pub summary: CandidateSummary,
    pub storages: Vec<StorageView>,
    pub networks: Vec<NetworkView>,
    pub schedtags: Vec<String>,
    pub session_usages: Vec<SessionUsageView>,
}

/// A host seen from the k8s scheduler extender, keyed by node name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct K8sCandidate {
    pub node_name: String,
    pub host_id: String,
    pub schedulable: bool,
    pub free_cpu: i64,
    pub free_memory_mb: i64,
}

/// Session usage as reported in candidate details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUsageView {
    pub session_id: String,
    pub count: i64,
    pub created_at: DateTime<Utc>,
    pub usage: PendingUsageView,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_input_defaults() {
        let input: ScheduleInput = serde_json::from_str("{}").unwrap();
        assert_eq!(input.count, 1);
        assert!(!input.backup);
        assert_eq!(input.hypervisor, Hypervisor::Kvm);
        assert!(input.schedtags.is_empty());
    }

    #[test]
    fn test_schedtags_parse_from_strings() {
        let input: ScheduleInput =
            serde_json::from_str(r#"{"schedtags": ["ssd:require", "gpu:avoid"]}"#).unwrap();
        assert_eq!(input.schedtags.len(), 2);
        assert_eq!(input.schedtags[1].strategy, SchedtagStrategy::Avoid);
    }

    #[test]
    fn test_schedtags_reject_unknown_strategy() {
        let result: Result<ScheduleInput, _> =
            serde_json::from_str(r#"{"schedtags": ["ssd:bogus"]}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_disk_size_by_backend() {
        let input = ScheduleInput {
            disks: vec![
                DiskSpec { backend: "local".into(), size_mb: 100 },
                DiskSpec { backend: "rbd".into(), size_mb: 50 },
                DiskSpec { backend: "local".into(), size_mb: 20 },
            ],
            ..Default::default()
        };
        let sizes = input.disk_size_by_backend();
        assert_eq!(sizes["local"], 120);
        assert_eq!(sizes["rbd"], 50);
    }

    #[test]
    fn test_result_entry_untagged() {
        let entry = ScheduleResultEntry::error("Out of resource");
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json, serde_json::json!({"error": "Out of resource"}));

        let resource = CandidateResource {
            session_id: "s1".into(),
            host: HostPick {
                id: "h1".into(),
                name: "host-1".into(),
                res_type: ResType::Host,
                zone_id: None,
                storage_ids: vec![],
                network_ids: vec![],
            },
            backup: None,
        };
        let json = serde_json::to_value(ScheduleResultEntry::Candidate(resource)).unwrap();
        assert_eq!(json["id"], "h1");
        assert!(json.get("backup").is_none());
    }

    #[test]
    fn test_picks_include_backup() {
        let pick = |id: &str| HostPick {
            id: id.into(),
            name: id.into(),
            res_type: ResType::Host,
            zone_id: None,
            storage_ids: vec![],
            network_ids: vec![],
        };
        let resource = CandidateResource {
            session_id: "s".into(),
            host: pick("a"),
            backup: Some(pick("b")),
        };
        let ids: Vec<_> = resource.picks().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_hypervisor_res_types() {
        assert_eq!(Hypervisor::Any.res_types(), vec![ResType::Host, ResType::Baremetal]);
        assert_eq!(Hypervisor::Baremetal.res_types(), vec![ResType::Baremetal]);
        assert_eq!(Hypervisor::Esxi.host_type(), Some("esxi"));
    }
}
