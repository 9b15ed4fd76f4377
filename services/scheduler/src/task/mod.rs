//! Scheduling tasks and their executors.
//!
//! A [`Task`] is one schedule request. It owns one [`TaskExecutor`] per
//! resource type the request has to search; executors are queued per
//! (resource type, pool) and run in submission order. The task resolves once
//! every executor succeeded, or as soon as one fails.

mod executor;
mod queue;

use std::sync::Arc;

use hostsched_api::{ResType, ScheduleInput};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use crate::error::{SchedError, SchedResult};
use crate::generic::SchedResultItemList;

pub use executor::{ExecutorContext, ExecutorStatus, TaskExecutor};
pub use queue::{QueueKey, TaskExecutorQueue, TaskQueueManager};

#[derive(Default)]
struct TaskState {
    results: Vec<SchedResultItemList>,
    error: Option<SchedError>,
    completed: usize,
    taken: bool,
}

pub struct Task {
    pub id: String,
    pub input: Arc<ScheduleInput>,
    executors: Vec<Arc<TaskExecutor>>,
    state: Mutex<TaskState>,
    done: watch::Sender<bool>,
}

impl Task {
    pub fn new(input: ScheduleInput, res_types: &[ResType]) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            id: Uuid::new_v4().to_string(),
            input: Arc::new(input),
            executors: res_types
                .iter()
                .map(|t| Arc::new(TaskExecutor::new(*t, weak.clone())))
                .collect(),
            state: Mutex::new(TaskState::default()),
            done: watch::Sender::new(false),
        })
    }

    pub fn executors(&self) -> &[Arc<TaskExecutor>] {
        &self.executors
    }

    pub fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    fn close(&self) {
        self.done.send_replace(true);
    }

    /// Completion callback of one executor.
    pub fn on_executor_done(&self, result: SchedResult<SchedResultItemList>) {
        let mut state = self.state.lock();
        match result {
            Ok(list) => {
                state.results.push(list);
                state.completed += 1;
                if state.error.is_none() && state.completed >= self.executors.len() {
                    drop(state);
                    debug!(task_id = %self.id, "All executors complete");
                    self.close();
                }
            }
            Err(e) => {
                if state.error.is_some() {
                    return;
                }
                debug!(task_id = %self.id, error = %e, "Executor failed, killing siblings");
                state.error = Some(e);
                drop(state);
                for executor in &self.executors {
                    executor.kill();
                }
                self.close();
            }
        }
    }

    /// Wait for the outcome: every executor's results merged, or the first
    /// error.
    pub async fn wait(&self) -> SchedResult<SchedResultItemList> {
        let mut rx = self.done.subscribe();
        rx.wait_for(|done| *done)
            .await
            .map_err(|_| SchedError::Internal("task channel closed".into()))?;

        let mut state = self.state.lock();
        if state.taken {
            return Err(SchedError::Internal(format!("result of task {} already taken", self.id)));
        }
        state.taken = true;
        if let Some(e) = state.error.take() {
            return Err(e);
        }

        let mut lists = std::mem::take(&mut state.results).into_iter();
        let mut merged = lists
            .next()
            .ok_or_else(|| SchedError::Internal("task finished without results".into()))?;
        for list in lists {
            merged.merge(list);
        }
        Ok(merged)
    }
}
