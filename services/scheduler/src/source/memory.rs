use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use hostsched_api::ResType;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::CandidateSource;
use crate::candidate::{BaremetalDesc, Candidate, HostDesc, InstanceGroup};
use crate::error::SourceError;

/// Inventory snapshot used to seed a [`MemorySource`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedData {
    #[serde(default)]
    pub hosts: Vec<HostDesc>,
    #[serde(default)]
    pub baremetals: Vec<BaremetalDesc>,
    #[serde(default)]
    pub instance_groups: Vec<InstanceGroup>,
}

impl SeedData {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SourceError::Unavailable(format!("read seed {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| SourceError::Decode {
            entity: "seed".to_string(),
            message: e.to_string(),
        })
    }
}

/// In-process inventory for dev mode and tests.
#[derive(Debug, Default)]
pub struct MemorySource {
    hosts: RwLock<BTreeMap<String, HostDesc>>,
    baremetals: RwLock<BTreeMap<String, BaremetalDesc>>,
    groups: RwLock<BTreeMap<String, InstanceGroup>>,
    /// Fetches touching these ids fail.
    fail_ids: RwLock<HashSet<String>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: SeedData) -> Result<Self, SourceError> {
        let source = Self::new();
        for host in seed.hosts {
            source.upsert(host)?;
        }
        for baremetal in seed.baremetals {
            source.upsert(baremetal)?;
        }
        for group in seed.instance_groups {
            source.upsert_instance_group(group);
        }
        Ok(source)
    }

    /// Insert or replace a host or baremetal.
    pub fn upsert(&self, candidate: impl Into<Candidate>) -> Result<(), SourceError> {
        let mut candidate = candidate.into();
        candidate.prepare().map_err(|e| SourceError::Decode {
            entity: candidate.id().to_string(),
            message: e.to_string(),
        })?;
        match candidate {
            Candidate::Host(h) => {
                self.hosts.write().insert(h.id.clone(), h);
            }
            Candidate::Baremetal(b) => {
                self.baremetals.write().insert(b.id.clone(), b);
            }
        }
        Ok(())
    }

    pub fn upsert_instance_group(&self, group: InstanceGroup) {
        self.groups.write().insert(group.id.clone(), group);
    }

    pub fn remove(&self, res_type: ResType, id: &str) -> bool {
        match res_type {
            ResType::Host => self.hosts.write().remove(id).is_some(),
            ResType::Baremetal => self.baremetals.write().remove(id).is_some(),
        }
    }

    /// Apply `f` to a stored host, if present.
    pub fn update_host(&self, id: &str, f: impl FnOnce(&mut HostDesc)) -> bool {
        match self.hosts.write().get_mut(id) {
            Some(host) => {
                f(host);
                if let Err(e) = host.prepare() {
                    warn!(host_id = %id, error = %e, "Updated host has invalid reserved cpus");
                }
                true
            }
            None => false,
        }
    }

    pub fn fail_ids<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fail_ids.write().extend(ids.into_iter().map(Into::into));
    }

    pub fn clear_failures(&self) {
        self.fail_ids.write().clear();
    }

    fn check_failures(&self, ids: &[String]) -> Result<(), SourceError> {
        let fail = self.fail_ids.read();
        match ids.iter().find(|id| fail.contains(*id)) {
            Some(id) => Err(SourceError::Unavailable(format!("fetch of {id} failed"))),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CandidateSource for MemorySource {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn fetch_by_ids(&self, res_type: ResType, ids: &[String]) -> Result<Vec<Candidate>, SourceError> {
        self.check_failures(ids)?;
        let found = match res_type {
            ResType::Host => {
                let hosts = self.hosts.read();
                ids.iter()
                    .filter_map(|id| hosts.get(id).cloned().map(Candidate::Host))
                    .collect()
            }
            ResType::Baremetal => {
                let baremetals = self.baremetals.read();
                ids.iter()
                    .filter_map(|id| baremetals.get(id).cloned().map(Candidate::Baremetal))
                    .collect()
            }
        };
        Ok(found)
    }

    async fn fetch_all(&self, res_type: ResType) -> Result<Vec<Candidate>, SourceError> {
        let all = match res_type {
            ResType::Host => self.hosts.read().values().cloned().map(Candidate::Host).collect(),
            ResType::Baremetal => self
                .baremetals
                .read()
                .values()
                .cloned()
                .map(Candidate::Baremetal)
                .collect(),
        };
        Ok(all)
    }

    async fn fetch_instance_groups(&self, ids: Option<&[String]>) -> Result<Vec<InstanceGroup>, SourceError> {
        let groups = self.groups.read();
        Ok(match ids {
            Some(ids) => ids.iter().filter_map(|id| groups.get(id).cloned()).collect(),
            None => groups.values().cloned().collect(),
        })
    }

    async fn health_check(&self) -> Result<(), SourceError> {
        Ok(())
    }
}
