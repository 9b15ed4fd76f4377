//! The scheduling subsystem of one process.
//!
//! [`SchedulerManager::new`] builds every component once and hands back the
//! background workers for the caller to spawn. Everything else receives the
//! manager by reference.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use hostsched_api::{
    CandidateDetail, CandidateList, CandidateSummary, CleanupArgs, CleanupResult,
    CompletedNotifyArgs, CompletedNotifyResult, ExpireRequest, ExpireResult, ForecastResult,
    K8sCandidate, NetworkView, ResType, ScheduleInput, ScheduleOutput, StorageView,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::cache::{CandidateCache, CandidateQuery, CandidateReloadWorker};
use crate::candidate::Candidate;
use crate::error::{SchedError, SchedResult};
use crate::expire::{ExpireConfig, ExpireManager, ExpireWorker};
use crate::generic::{GenericScheduler, SchedResultItemList};
use crate::history::{HistoryItem, HistoryManager};
use crate::pending_usage::{PendingUsageGcConfig, PendingUsageGcWorker, PendingUsageManager};
use crate::placement;
use crate::reload_cancel::{ReloadCancelQueue, ReloadCancelTask, ReloadCancelWorker};
use crate::source::CandidateSource;
use crate::task::{ExecutorContext, Task, TaskQueueManager};

/// Scheduling knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub reload_interval: Duration,
    pub expire: ExpireConfig,
    pub reload_cancel_queue_size: usize,
    pub pending_gc: PendingUsageGcConfig,
    pub history_limit: usize,
    pub predicate_parallelism: usize,
    pub task_queue_size: usize,
    /// Largest `count` one schedule call may ask for.
    pub max_schedule_count: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            reload_interval: Duration::from_secs(300),
            expire: ExpireConfig::default(),
            reload_cancel_queue_size: 1000,
            pending_gc: PendingUsageGcConfig::default(),
            history_limit: 1000,
            predicate_parallelism: 8,
            task_queue_size: 100,
            max_schedule_count: 1000,
        }
    }
}

/// Background loops of the scheduler, not yet running.
pub struct Workers {
    pub expire: ExpireWorker,
    pub reload_cancel: ReloadCancelWorker,
    pub reload: CandidateReloadWorker,
    pub pending_gc: PendingUsageGcWorker,
}

impl Workers {
    /// Spawn every worker; each stops when `shutdown` flips to true.
    pub fn spawn(self, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let Workers {
            expire,
            reload_cancel,
            reload,
            pending_gc,
        } = self;
        vec![
            tokio::spawn(expire.run(shutdown.clone())),
            tokio::spawn(reload_cancel.run(shutdown.clone())),
            {
                let rx = shutdown.clone();
                tokio::spawn(async move { reload.run(rx).await })
            },
            {
                let rx = shutdown.clone();
                tokio::spawn(async move { pending_gc.run(rx).await })
            },
        ]
    }
}

pub struct SchedulerManager {
    cache: Arc<CandidateCache>,
    ledger: Arc<PendingUsageManager>,
    expire: ExpireManager,
    reload_cancel: ReloadCancelQueue,
    queues: TaskQueueManager,
    history: HistoryManager,
    max_schedule_count: i64,
}

impl SchedulerManager {
    pub fn new(
        config: SchedulerConfig,
        source: Arc<dyn CandidateSource>,
    ) -> SchedResult<(Arc<Self>, Workers)> {
        let cache = Arc::new(CandidateCache::new(source));
        let ledger = Arc::new(PendingUsageManager::new());
        let scheduler = Arc::new(GenericScheduler::new(config.predicate_parallelism)?);

        let (expire, expire_worker) =
            ExpireManager::new(cache.clone(), ledger.clone(), config.expire.clone());
        let (reload_cancel, reload_cancel_worker) =
            ReloadCancelQueue::new(cache.clone(), ledger.clone(), config.reload_cancel_queue_size);

        let ctx = Arc::new(ExecutorContext {
            cache: cache.clone(),
            ledger: ledger.clone(),
            scheduler,
        });

        let workers = Workers {
            expire: expire_worker,
            reload_cancel: reload_cancel_worker,
            reload: CandidateReloadWorker::new(cache.clone(), ledger.clone(), config.reload_interval),
            pending_gc: PendingUsageGcWorker::new(ledger.clone(), config.pending_gc.clone()),
        };

        let manager = Arc::new(Self {
            cache,
            ledger,
            expire,
            reload_cancel,
            queues: TaskQueueManager::new(ctx, config.task_queue_size),
            history: HistoryManager::new(config.history_limit),
            max_schedule_count: config.max_schedule_count,
        });
        Ok((manager, workers))
    }

    /// Initial full load of candidates and instance groups.
    pub async fn load(&self) -> SchedResult<()> {
        self.cache.load_all().await?;
        info!(
            hosts = self.cache.len(ResType::Host),
            baremetals = self.cache.len(ResType::Baremetal),
            "Candidate cache loaded"
        );
        Ok(())
    }

    pub fn cache(&self) -> &Arc<CandidateCache> {
        &self.cache
    }

    pub fn ledger(&self) -> &Arc<PendingUsageManager> {
        &self.ledger
    }

    pub fn history(&self) -> &HistoryManager {
        &self.history
    }

    pub fn is_ready(&self) -> bool {
        self.cache.is_loaded() && !self.queues.is_shutdown()
    }

    /// Stop accepting schedule work; queued executors are killed.
    pub fn shutdown(&self) {
        self.queues.shutdown();
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    async fn validate(&self, input: &ScheduleInput) -> SchedResult<()> {
        let invalid = |msg: String| Err(SchedError::InvalidInput(msg));

        if input.count < 1 {
            return invalid(format!("count must be at least 1, got {}", input.count));
        }
        if input.count > self.max_schedule_count {
            return invalid(format!(
                "count {} exceeds the limit of {}",
                input.count, self.max_schedule_count
            ));
        }
        if input.vcpu_count < 0 || input.memory_mb < 0 || input.isolated_devices < 0 {
            return invalid("requested resources must not be negative".into());
        }
        if let Some(disk) = input.disks.iter().find(|d| d.size_mb < 0) {
            return invalid(format!("disk on backend {} has negative size", disk.backend));
        }
        if input.backup && input.hypervisor.res_types().contains(&ResType::Baremetal) {
            return invalid("backup placement is not supported for baremetals".into());
        }
        if let (Some(master), Some(backup)) = (&input.prefer_host, &input.prefer_backup_host) {
            if master == backup {
                return invalid(format!("prefer host and prefer backup host are both {master}"));
            }
        }

        if !input.instance_group_ids.is_empty() {
            let wanted: HashSet<&str> = input.instance_group_ids.iter().map(String::as_str).collect();
            let found = self.cache.instance_groups(&input.instance_group_ids).await?;
            let found: HashSet<&str> = found.iter().map(|g| g.id.as_str()).collect();
            let mut missing: Vec<&str> = wanted.difference(&found).copied().collect();
            if !missing.is_empty() {
                missing.sort_unstable();
                return invalid(format!("unknown instance groups: {}", missing.join(", ")));
            }
        }
        Ok(())
    }

    fn new_task(input: ScheduleInput) -> Arc<Task> {
        let res_types = input.hypervisor.res_types();
        Task::new(input, &res_types)
    }

    /// Submit `task` and wait for its ranked result.
    async fn run_task(&self, task: &Arc<Task>) -> SchedResult<SchedResultItemList> {
        self.queues.add_task(task).await?;
        task.wait().await
    }

    /// Place `input.count` servers and reserve what was placed.
    #[instrument(skip(self, input), fields(session_id = tracing::field::Empty, count = input.count, backup = input.backup))]
    pub async fn schedule(&self, mut input: ScheduleInput) -> SchedResult<ScheduleOutput> {
        self.validate(&input).await?;
        let session_id = input
            .session_id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        tracing::Span::current().record("session_id", session_id.as_str());

        self.expire.trigger().await?;

        let started = Instant::now();
        let created_at = Utc::now();
        let task = Self::new_task(input.clone());
        let result = self.run_task(&task).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let mut list = match result {
            Ok(list) => list,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Schedule task failed");
                self.history.record(HistoryItem {
                    task_id: task.id.clone(),
                    session_id,
                    created_at,
                    elapsed_ms,
                    input,
                    output: None,
                    error: Some(e.to_string()),
                });
                return Err(e);
            }
        };

        let candidates = placement::place(&mut list, input.count, &session_id);
        if !input.suggestion {
            let placed: Vec<_> = candidates.iter().filter_map(|e| e.candidate()).collect();
            for resource in &placed {
                self.ledger.add_pending_usage(&input, resource);
            }
            for res_type in ResType::ALL {
                self.cache.set_candidates_dirty(
                    res_type,
                    placed
                        .iter()
                        .flat_map(|r| r.picks())
                        .filter(|pick| pick.res_type == res_type)
                        .map(|pick| pick.id.as_str()),
                );
            }
        }

        let output = ScheduleOutput {
            task_id: task.id.clone(),
            session_id: session_id.clone(),
            candidates,
        };
        info!(
            task_id = %task.id,
            placed = output.success_count(),
            candidates = list.len(),
            elapsed_ms,
            "Schedule complete"
        );

        self.history.record(HistoryItem {
            task_id: task.id.clone(),
            session_id,
            created_at,
            elapsed_ms,
            input,
            output: Some(output.clone()),
            error: None,
        });
        Ok(output)
    }

    /// How many servers of this shape fit right now. Reserves nothing.
    #[instrument(skip(self, input), fields(count = input.count))]
    pub async fn forecast(&self, mut input: ScheduleInput) -> SchedResult<ForecastResult> {
        self.validate(&input).await?;
        input.suggestion = true;
        self.expire.trigger().await?;

        let req_count = input.count;
        let backup = input.backup;
        let list = self.run_task(&Self::new_task(input)).await?;

        let total = list.total_capacity();
        let allow_count = if backup { total / 2 } else { total };
        Ok(ForecastResult {
            can_create: allow_count >= req_count,
            req_count,
            allow_count,
            candidates: list.items.iter().map(|item| item.to_forecast()).collect(),
            filtered: list.unit.log.aggregate(),
        })
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Queue stale hosts for reload; with `trigger`, wait for the flush.
    #[instrument(skip(self, request), fields(session_id = ?request.args.session_id, trigger = request.trigger))]
    pub async fn expire(&self, request: ExpireRequest) -> SchedResult<ExpireResult> {
        let queued = !request.args.is_empty() && self.expire.add(request.args);
        let flushed = if request.trigger {
            self.expire.trigger().await?;
            true
        } else {
            false
        };
        Ok(ExpireResult { queued, flushed })
    }

    /// The session is committed downstream: reload its hosts, then release
    /// its reservations.
    #[instrument(skip(self, args), fields(session_id = %args.session_id))]
    pub fn completed_notify(&self, args: CompletedNotifyArgs) -> SchedResult<CompletedNotifyResult> {
        if args.session_id.is_empty() {
            return Err(SchedError::InvalidInput("session_id is required".into()));
        }
        let usages = self.ledger.session_usages(&args.session_id);
        let hosts: Vec<String> = usages.iter().map(|u| u.host_id.clone()).collect();

        let tasks = ReloadCancelTask::from_usages(usages);
        let submitted = tasks.len();
        let queued = self.reload_cancel.add_batch(tasks);
        if queued < submitted {
            warn!(submitted, queued, "Some reload-cancel tasks were dropped");
        }

        Ok(CompletedNotifyResult {
            session_id: args.session_id,
            hosts,
        })
    }

    /// Full reload, then drop every reservation older than the reload.
    #[instrument(skip(self, args), fields(res_type = ?args.res_type))]
    pub async fn cleanup(&self, args: CleanupArgs) -> SchedResult<CleanupResult> {
        let res_types: Vec<ResType> = match args.res_type {
            Some(t) => vec![t],
            None => ResType::ALL.to_vec(),
        };

        let cutoff = self.ledger.set_reload_all_start_time();
        let mut reloaded = 0;
        for res_type in &res_types {
            reloaded += self.cache.reload_all(*res_type).await?;
        }
        self.cache.reload_instance_groups().await?;

        let sessions_cleared = match args.res_type {
            None => self.ledger.clear_session_usages_before(cutoff, None, None),
            Some(res_type) => {
                let ids: Vec<String> = self
                    .cache
                    .get_candidates(&CandidateQuery::new(res_type))
                    .iter()
                    .map(|c| c.id().to_string())
                    .collect();
                self.ledger.clear_session_usages_before(cutoff, None, Some(ids.as_slice()))
            }
        };

        let locks_pruned = self.ledger.prune_idle_host_locks();
        info!(reloaded, sessions_cleared, locks_pruned, "Cleanup complete");
        Ok(CleanupResult {
            reloaded,
            sessions_cleared,
        })
    }

    // =========================================================================
    // Candidate views
    // =========================================================================

    fn summarize(&self, candidate: &Candidate) -> CandidateSummary {
        let pending = self.ledger.get_pending_usage(candidate.id());
        let getter = candidate.getter(pending.as_ref());
        CandidateSummary {
            id: candidate.id().to_string(),
            name: candidate.name().to_string(),
            res_type: candidate.res_type(),
            zone_id: candidate.zone_id().map(str::to_string),
            pool_id: candidate.pool_id().map(str::to_string),
            host_type: candidate.host_type().to_string(),
            status: candidate.status().to_string(),
            free_cpu: getter.free_cpu(),
            free_memory_mb: getter.free_memory_mb(),
            free_storage_mb: getter.total_free_storage_mb(),
            pending: pending.map(|p| p.to_view()).unwrap_or_default(),
            dirty: self.cache.dirty_count(candidate.res_type(), candidate.id()),
        }
    }

    pub fn candidate_list(&self, query: &CandidateQuery, offset: usize, limit: usize) -> CandidateList {
        let candidates = self.cache.get_candidates(query);
        CandidateList {
            total: candidates.len(),
            offset,
            items: candidates
                .iter()
                .skip(offset)
                .take(limit)
                .map(|c| self.summarize(c))
                .collect(),
        }
    }

    pub fn candidate_detail(&self, id: &str) -> Option<CandidateDetail> {
        let candidate = self.cache.get_candidate(id)?;
        let pending = self.ledger.get_pending_usage(id);
        let getter = candidate.getter(pending.as_ref());

        let storages = getter
            .storages_free()
            .into_iter()
            .map(|(storage, free_mb)| StorageView {
                id: storage.id.clone(),
                backend: storage.backend.clone(),
                capacity_mb: storage.capacity_mb,
                free_mb,
            })
            .collect();
        let networks = candidate
            .networks()
            .iter()
            .map(|net| {
                let net_pending = self.ledger.get_net_pending_usage(&net.id);
                NetworkView {
                    id: net.id.clone(),
                    wire_id: net.wire_id.clone(),
                    free_addresses: getter.free_addresses(&net.id, net_pending).unwrap_or(0),
                    pending: net_pending,
                }
            })
            .collect();

        Some(CandidateDetail {
            summary: self.summarize(&candidate),
            storages,
            networks,
            schedtags: candidate.schedtags().to_vec(),
            session_usages: self
                .ledger
                .host_session_usages(id)
                .iter()
                .map(|s| s.to_view())
                .collect(),
        })
    }

    /// Hosts as the k8s scheduler extender sees them, keyed by node name.
    pub fn k8s_candidate_hosts(&self, node_names: &[String]) -> Vec<K8sCandidate> {
        self.cache
            .get_by_node_names(node_names)
            .iter()
            .filter_map(|candidate| {
                let node_name = candidate.node_name()?.to_string();
                let pending = self.ledger.get_pending_usage(candidate.id());
                let getter = candidate.getter(pending.as_ref());
                Some(K8sCandidate {
                    node_name,
                    host_id: candidate.id().to_string(),
                    schedulable: candidate.is_schedulable(),
                    free_cpu: getter.free_cpu(),
                    free_memory_mb: getter.free_memory_mb(),
                })
            })
            .collect()
    }
}
