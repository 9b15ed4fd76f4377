//! In-memory candidate store with full and partial reload.
//!
//! Readers get `Arc<Candidate>` snapshots straight from concurrent maps and
//! never wait on the data source. Reloads replace whole entries, so a reader
//! sees either the old or the new candidate, never a mix.

mod worker;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use hostsched_api::ResType;
use tracing::{debug, info, instrument, warn};

use crate::candidate::{Candidate, InstanceGroup};
use crate::error::{CacheError, SourceError};
use crate::source::CandidateSource;

pub use worker::CandidateReloadWorker;

/// Ids fetched per source round trip during a partial reload.
pub const DEFAULT_RELOAD_BATCH_SIZE: usize = 100;

/// Scope of a candidate lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateQuery {
    pub res_type: Option<ResType>,
    pub zone_id: Option<String>,
    pub pool_id: Option<String>,
    pub region_id: Option<String>,
}

impl CandidateQuery {
    pub fn new(res_type: ResType) -> Self {
        Self {
            res_type: Some(res_type),
            ..Default::default()
        }
    }

    pub fn matches(&self, candidate: &Candidate) -> bool {
        fn scoped(want: &Option<String>, have: Option<&str>) -> bool {
            want.as_deref().is_none_or(|w| have == Some(w))
        }
        scoped(&self.zone_id, candidate.zone_id())
            && scoped(&self.pool_id, candidate.pool_id())
            && scoped(&self.region_id, candidate.region_id())
    }
}

/// Outcome of a partial reload.
///
/// Successful batches are applied even when others fail.
#[derive(Debug, Default)]
pub struct ReloadReport {
    pub refreshed: Vec<Arc<Candidate>>,
    /// Ids the source no longer knows; evicted from the cache.
    pub removed: Vec<String>,
    /// Ids whose batch failed; their cached entries were left untouched.
    pub failed: Vec<String>,
    pub last_error: Option<SourceError>,
    total: usize,
}

impl ReloadReport {
    pub fn is_ok(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn into_result(self) -> Result<Vec<Arc<Candidate>>, CacheError> {
        match self.last_error {
            None => Ok(self.refreshed),
            Some(e) => Err(CacheError::PartialReload {
                failed: self.failed.len(),
                total: self.total,
                last_error: e.to_string(),
            }),
        }
    }
}

pub struct CandidateCache {
    source: Arc<dyn CandidateSource>,
    hosts: DashMap<String, Arc<Candidate>>,
    baremetals: DashMap<String, Arc<Candidate>>,
    groups: DashMap<String, InstanceGroup>,
    dirty_hosts: DashMap<String, u64>,
    dirty_baremetals: DashMap<String, u64>,
    reload_batch_size: usize,
    loaded: AtomicBool,
}

impl CandidateCache {
    pub fn new(source: Arc<dyn CandidateSource>) -> Self {
        Self::with_batch_size(source, DEFAULT_RELOAD_BATCH_SIZE)
    }

    pub fn with_batch_size(source: Arc<dyn CandidateSource>, reload_batch_size: usize) -> Self {
        Self {
            source,
            hosts: DashMap::new(),
            baremetals: DashMap::new(),
            groups: DashMap::new(),
            dirty_hosts: DashMap::new(),
            dirty_baremetals: DashMap::new(),
            reload_batch_size: reload_batch_size.max(1),
            loaded: AtomicBool::new(false),
        }
    }

    pub fn source(&self) -> &Arc<dyn CandidateSource> {
        &self.source
    }

    fn store(&self, res_type: ResType) -> &DashMap<String, Arc<Candidate>> {
        match res_type {
            ResType::Host => &self.hosts,
            ResType::Baremetal => &self.baremetals,
        }
    }

    fn dirty(&self, res_type: ResType) -> &DashMap<String, u64> {
        match res_type {
            ResType::Host => &self.dirty_hosts,
            ResType::Baremetal => &self.dirty_baremetals,
        }
    }

    /// True once a full load of every resource type succeeded.
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Candidates matching `query`, ordered by id.
    pub fn get_candidates(&self, query: &CandidateQuery) -> Vec<Arc<Candidate>> {
        let types: Vec<ResType> = match query.res_type {
            Some(t) => vec![t],
            None => ResType::ALL.to_vec(),
        };
        let mut found: Vec<Arc<Candidate>> = types
            .into_iter()
            .flat_map(|t| {
                self.store(t)
                    .iter()
                    .filter(|entry| query.matches(entry.value()))
                    .map(|entry| entry.value().clone())
                    .collect::<Vec<_>>()
            })
            .collect();
        found.sort_by(|a, b| a.id().cmp(b.id()));
        found
    }

    /// Cached candidates among `ids`, in request order. Unknown ids are skipped.
    pub fn get_candidates_by_ids(&self, res_type: ResType, ids: &[String]) -> Vec<Arc<Candidate>> {
        let store = self.store(res_type);
        ids.iter()
            .filter_map(|id| store.get(id).map(|c| c.clone()))
            .collect()
    }

    /// Look a candidate up in every store.
    pub fn get_candidate(&self, id: &str) -> Option<Arc<Candidate>> {
        ResType::ALL
            .iter()
            .find_map(|t| self.store(*t).get(id).map(|c| c.clone()))
    }

    /// Hosts backing the given k8s nodes, in request order.
    pub fn get_by_node_names(&self, names: &[String]) -> Vec<Arc<Candidate>> {
        let mut by_node: Vec<Arc<Candidate>> = Vec::new();
        for name in names {
            if let Some(host) = self
                .hosts
                .iter()
                .find(|entry| entry.node_name() == Some(name.as_str()))
            {
                by_node.push(host.value().clone());
            }
        }
        by_node
    }

    pub fn len(&self, res_type: ResType) -> usize {
        self.store(res_type).len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty() && self.baremetals.is_empty()
    }

    // =========================================================================
    // Instance groups
    // =========================================================================

    /// Look up instance groups, fetching any the cache does not hold yet.
    pub async fn instance_groups(&self, ids: &[String]) -> Result<Vec<InstanceGroup>, CacheError> {
        let missing: Vec<String> = ids
            .iter()
            .filter(|id| !self.groups.contains_key(*id))
            .cloned()
            .collect();
        if !missing.is_empty() {
            for group in self.source.fetch_instance_groups(Some(missing.as_slice())).await? {
                self.groups.insert(group.id.clone(), group);
            }
        }
        Ok(ids
            .iter()
            .filter_map(|id| self.groups.get(id).map(|g| g.clone()))
            .collect())
    }

    pub async fn reload_instance_groups(&self) -> Result<usize, CacheError> {
        let groups = self.source.fetch_instance_groups(None).await?;
        let keep: HashSet<String> = groups.iter().map(|g| g.id.clone()).collect();
        for group in groups {
            self.groups.insert(group.id.clone(), group);
        }
        self.groups.retain(|id, _| keep.contains(id));
        Ok(keep.len())
    }

    // =========================================================================
    // Reloads
    // =========================================================================

    /// Refresh only `ids` from the source.
    #[instrument(skip(self, ids), fields(res_type = %res_type, count = ids.len()))]
    pub async fn reload(&self, res_type: ResType, ids: &[String]) -> ReloadReport {
        let mut seen = HashSet::new();
        let ids: Vec<String> = ids.iter().filter(|id| seen.insert(*id)).cloned().collect();

        let store = self.store(res_type);
        let mut report = ReloadReport {
            total: ids.len(),
            ..Default::default()
        };

        for chunk in ids.chunks(self.reload_batch_size) {
            match self.source.fetch_by_ids(res_type, chunk).await {
                Ok(fetched) => {
                    let fetched_ids: HashSet<String> =
                        fetched.iter().map(|c| c.id().to_string()).collect();
                    for candidate in fetched {
                        let candidate = Arc::new(candidate);
                        store.insert(candidate.id().to_string(), candidate.clone());
                        report.refreshed.push(candidate);
                    }
                    for id in chunk.iter().filter(|id| !fetched_ids.contains(*id)) {
                        if store.remove(id).is_some() {
                            report.removed.push(id.clone());
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, batch = chunk.len(), "Candidate reload batch failed");
                    report.failed.extend(chunk.iter().cloned());
                    report.last_error = Some(e);
                }
            }
        }

        debug!(
            refreshed = report.refreshed.len(),
            removed = report.removed.len(),
            failed = report.failed.len(),
            "Partial reload complete"
        );
        report
    }

    /// Rebuild the whole snapshot of one resource type.
    #[instrument(skip(self), fields(res_type = %res_type))]
    pub async fn reload_all(&self, res_type: ResType) -> Result<usize, CacheError> {
        let fetched = self.source.fetch_all(res_type).await?;
        let store = self.store(res_type);
        let keep: HashSet<String> = fetched.iter().map(|c| c.id().to_string()).collect();

        for candidate in fetched {
            store.insert(candidate.id().to_string(), Arc::new(candidate));
        }
        store.retain(|id, _| keep.contains(id));
        self.dirty(res_type).retain(|id, _| keep.contains(id));

        info!(count = keep.len(), "Full candidate reload complete");
        Ok(keep.len())
    }

    /// Load every resource type and the instance groups.
    pub async fn load_all(&self) -> Result<(), CacheError> {
        for res_type in ResType::ALL {
            self.reload_all(res_type).await?;
        }
        self.reload_instance_groups().await?;
        self.loaded.store(true, Ordering::Release);
        Ok(())
    }

    // =========================================================================
    // Dirty marks
    // =========================================================================

    pub fn set_candidate_dirty(&self, res_type: ResType, id: &str) {
        *self.dirty(res_type).entry(id.to_string()).or_insert(0) += 1;
    }

    pub fn set_candidates_dirty<'a>(&self, res_type: ResType, ids: impl IntoIterator<Item = &'a str>) {
        for id in ids {
            self.set_candidate_dirty(res_type, id);
        }
    }

    pub fn dirty_count(&self, res_type: ResType, id: &str) -> u64 {
        self.dirty(res_type).get(id).map(|c| *c).unwrap_or(0)
    }

    /// Ids currently marked dirty, ordered by id.
    pub fn dirty_ids(&self, res_type: ResType) -> Vec<String> {
        let mut ids: Vec<String> = self.dirty(res_type).iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn clear_dirty(&self, res_type: ResType, ids: &[String]) {
        let dirty = self.dirty(res_type);
        for id in ids {
            dirty.remove(id);
        }
    }
}
