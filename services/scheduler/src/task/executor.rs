use std::sync::{Arc, Weak};

use hostsched_api::{ResType, ScheduleInput};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use super::Task;
use crate::cache::{CandidateCache, CandidateQuery};
use crate::error::{SchedError, SchedResult};
use crate::generic::{GenericScheduler, SchedResultItemList};
use crate::pending_usage::PendingUsageManager;
use crate::unit::Unit;

/// Lifecycle of one executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorStatus {
    Waiting,
    Running,
    Success,
    Failed,
    Killed,
}

impl ExecutorStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutorStatus::Success | ExecutorStatus::Failed | ExecutorStatus::Killed
        )
    }
}

/// Everything an executor needs to run a scheduling pass.
pub struct ExecutorContext {
    pub cache: Arc<CandidateCache>,
    pub ledger: Arc<PendingUsageManager>,
    pub scheduler: Arc<GenericScheduler>,
}

/// Schedules one request against one resource type.
pub struct TaskExecutor {
    pub res_type: ResType,
    task: Weak<Task>,
    status: Mutex<ExecutorStatus>,
    unit: Mutex<Option<Arc<Unit>>>,
}

impl TaskExecutor {
    pub(super) fn new(res_type: ResType, task: Weak<Task>) -> Self {
        Self {
            res_type,
            task,
            status: Mutex::new(ExecutorStatus::Waiting),
            unit: Mutex::new(None),
        }
    }

    pub fn status(&self) -> ExecutorStatus {
        *self.status.lock()
    }

    pub fn task(&self) -> Option<Arc<Task>> {
        self.task.upgrade()
    }

    /// Move a waiting executor to `Killed`. Running executors are not preempted.
    pub fn kill(&self) -> bool {
        let mut status = self.status.lock();
        if *status == ExecutorStatus::Waiting {
            *status = ExecutorStatus::Killed;
            true
        } else {
            false
        }
    }

    /// Kill and report the kill to the owning task.
    pub fn abort(&self) {
        if self.kill() {
            if let Some(task) = self.task() {
                task.on_executor_done(Err(SchedError::Killed));
            }
        }
    }

    fn start(&self) -> bool {
        let mut status = self.status.lock();
        if *status == ExecutorStatus::Waiting {
            *status = ExecutorStatus::Running;
            true
        } else {
            false
        }
    }

    #[instrument(skip(self, ctx), fields(res_type = %self.res_type))]
    pub async fn execute(self: Arc<Self>, ctx: &ExecutorContext) {
        if !self.start() {
            debug!("Executor no longer waiting, skipped");
            return;
        }

        let result = self.run(ctx).await;
        *self.status.lock() = match result {
            Ok(_) => ExecutorStatus::Success,
            Err(_) => ExecutorStatus::Failed,
        };
        if let Err(e) = &result {
            warn!(error = %e, "Executor failed");
        }

        if let Some(task) = self.task() {
            task.on_executor_done(result);
        }

        let this = self.clone();
        tokio::spawn(async move {
            if let Some(unit) = this.unit.lock().take() {
                debug!(task_id = %unit.task_id, "Released executor unit");
            }
        });
    }

    async fn run(&self, ctx: &ExecutorContext) -> SchedResult<SchedResultItemList> {
        let task = self
            .task()
            .ok_or_else(|| SchedError::Internal("task dropped before executor ran".into()))?;
        let input = task.input.clone();

        let query = CandidateQuery {
            res_type: Some(self.res_type),
            zone_id: input.zone_id.clone(),
            pool_id: input.pool_id.clone(),
            region_id: input.region_id.clone(),
        };
        let pinned = pinned_pair(&input)
            .map(|ids| ctx.cache.get_candidates_by_ids(self.res_type, &ids))
            .filter(|found| found.len() == 2 && found.iter().all(|c| query.matches(c)));
        let candidates = match pinned {
            Some(pair) => {
                debug!(task_id = %task.id, "Scheduling against the preferred HA pair only");
                pair
            }
            None => ctx.cache.get_candidates(&query),
        };
        let groups = ctx.cache.instance_groups(&input.instance_group_ids).await?;

        let unit = Arc::new(Unit::new(
            task.id.clone(),
            input,
            &ctx.ledger,
            &candidates,
            groups,
        ));
        *self.unit.lock() = Some(unit.clone());

        let scheduler = ctx.scheduler.clone();
        tokio::task::spawn_blocking(move || scheduler.schedule(unit, &candidates))
            .await
            .map_err(|e| SchedError::Internal(format!("scheduling pass panicked: {e}")))
    }
}

/// Host ids of an HA request that names both its master and backup. Pair
/// placement never leaves such a pair, so only those two need scoring.
fn pinned_pair(input: &ScheduleInput) -> Option<Vec<String>> {
    if !input.backup || !input.instance_group_ids.is_empty() {
        return None;
    }
    Some(vec![input.prefer_host.clone()?, input.prefer_backup_host.clone()?])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::testing::{host, host_on_wire};
    use crate::source::MemorySource;

    async fn context() -> ExecutorContext {
        let source = Arc::new(MemorySource::new());
        source.upsert(host("h1", 8, 8192)).unwrap();
        source.upsert(host("h2", 2, 8192)).unwrap();
        let cache = Arc::new(CandidateCache::new(source));
        cache.load_all().await.unwrap();
        ExecutorContext {
            cache,
            ledger: Arc::new(PendingUsageManager::new()),
            scheduler: Arc::new(GenericScheduler::new(2).unwrap()),
        }
    }

    #[tokio::test]
    async fn test_execute_reports_to_task() {
        let ctx = context().await;
        let task = Task::new(
            ScheduleInput {
                vcpu_count: 4,
                ..Default::default()
            },
            &[ResType::Host],
        );
        let executor = task.executors()[0].clone();
        executor.clone().execute(&ctx).await;

        assert_eq!(executor.status(), ExecutorStatus::Success);
        let list = task.wait().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list.items[0].id(), "h1");
    }

    #[tokio::test]
    async fn test_kill_only_while_waiting() {
        let ctx = context().await;
        let task = Task::new(ScheduleInput::default(), &[ResType::Host]);
        let executor = task.executors()[0].clone();

        assert!(executor.kill());
        assert!(!executor.kill());
        executor.clone().execute(&ctx).await;
        assert_eq!(executor.status(), ExecutorStatus::Killed);
    }

    #[tokio::test]
    async fn test_preferred_ha_pair_is_looked_up_by_id() {
        let source = Arc::new(MemorySource::new());
        for id in ["h1", "h2", "h3"] {
            source.upsert(host_on_wire(id, 8, 8192, "w1")).unwrap();
        }
        let cache = Arc::new(CandidateCache::new(source));
        cache.load_all().await.unwrap();
        let ctx = ExecutorContext {
            cache,
            ledger: Arc::new(PendingUsageManager::new()),
            scheduler: Arc::new(GenericScheduler::new(2).unwrap()),
        };

        let pinned = ScheduleInput {
            backup: true,
            prefer_host: Some("h3".into()),
            prefer_backup_host: Some("h1".into()),
            ..Default::default()
        };
        let task = Task::new(pinned, &[ResType::Host]);
        task.executors()[0].clone().execute(&ctx).await;
        let list = task.wait().await.unwrap();
        let mut ids: Vec<&str> = list.items.iter().map(|i| i.id()).collect();
        ids.sort_unstable();
        assert_eq!(ids, ["h1", "h3"]);

        // Names are not ids; fall back to the full candidate set.
        let by_name = ScheduleInput {
            backup: true,
            prefer_host: Some("h3-name".into()),
            prefer_backup_host: Some("h1-name".into()),
            ..Default::default()
        };
        let task = Task::new(by_name, &[ResType::Host]);
        task.executors()[0].clone().execute(&ctx).await;
        assert_eq!(task.wait().await.unwrap().len(), 3);
    }
}
