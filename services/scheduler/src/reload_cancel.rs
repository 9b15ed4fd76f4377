//! Reload-then-cancel queue.
//!
//! When a session completes downstream its reservations are now part of the
//! inventory. Hosts are reloaded first and only then are the session usages
//! cancelled, so the capacity is never counted as free in between.

use std::sync::Arc;

use hostsched_api::ResType;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};

use crate::cache::CandidateCache;
use crate::pending_usage::{PendingUsageManager, SessionPendingUsage};

pub struct ReloadCancelTask {
    pub res_type: ResType,
    pub host_ids: Vec<String>,
    pub session_usages: Vec<Arc<SessionPendingUsage>>,
}

impl ReloadCancelTask {
    /// One task per resource type found among `usages`.
    pub fn from_usages(usages: Vec<Arc<SessionPendingUsage>>) -> Vec<Self> {
        let mut tasks: Vec<Self> = Vec::new();
        for usage in usages {
            let idx = match tasks.iter().position(|t| t.res_type == usage.res_type) {
                Some(idx) => idx,
                None => {
                    tasks.push(Self {
                        res_type: usage.res_type,
                        host_ids: Vec::new(),
                        session_usages: Vec::new(),
                    });
                    tasks.len() - 1
                }
            };
            let task = &mut tasks[idx];
            if !task.host_ids.contains(&usage.host_id) {
                task.host_ids.push(usage.host_id.clone());
            }
            task.session_usages.push(usage);
        }
        tasks
    }
}

#[derive(Clone)]
pub struct ReloadCancelQueue {
    tx: mpsc::Sender<ReloadCancelTask>,
}

impl ReloadCancelQueue {
    pub fn new(
        cache: Arc<CandidateCache>,
        ledger: Arc<PendingUsageManager>,
        queue_size: usize,
    ) -> (Self, ReloadCancelWorker) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        (Self { tx }, ReloadCancelWorker { rx, cache, ledger })
    }

    /// Queue one task; a full queue drops it.
    pub fn add(&self, task: ReloadCancelTask) -> bool {
        let hosts = task.host_ids.len();
        match self.tx.try_send(task) {
            Ok(()) => true,
            Err(e) => {
                warn!(res_type = %e.into_inner().res_type, hosts, "Reload-cancel queue unavailable, dropping task");
                false
            }
        }
    }

    /// Queue several tasks; returns how many were accepted.
    pub fn add_batch(&self, tasks: Vec<ReloadCancelTask>) -> usize {
        tasks.into_iter().map(|t| self.add(t)).filter(|ok| *ok).count()
    }
}

pub struct ReloadCancelWorker {
    rx: mpsc::Receiver<ReloadCancelTask>,
    cache: Arc<CandidateCache>,
    ledger: Arc<PendingUsageManager>,
}

impl ReloadCancelWorker {
    #[instrument(skip(self, shutdown))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting reload-cancel worker");
        loop {
            tokio::select! {
                task = self.rx.recv() => match task {
                    Some(task) => {
                        self.process(task).await;
                    }
                    None => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Reload-cancel worker shutting down");
    }

    /// Reload the task's hosts, then cancel the usages on hosts that reloaded.
    pub async fn process(&self, task: ReloadCancelTask) -> usize {
        self.ledger.set_reload_start_time();
        let report = self.cache.reload(task.res_type, &task.host_ids).await;
        if let Some(e) = &report.last_error {
            warn!(
                res_type = %task.res_type,
                failed = report.failed.len(),
                error = %e,
                "Reload before cancel failed; usages on those hosts are kept"
            );
        }

        let cancelled = task
            .session_usages
            .iter()
            .filter(|usage| !report.failed.contains(&usage.host_id))
            .filter(|usage| {
                self.ledger
                    .cancel_pending_usage(&usage.host_id, Some(usage.as_ref()))
            })
            .count();
        debug!(
            res_type = %task.res_type,
            hosts = task.host_ids.len(),
            cancelled,
            "Reload-cancel task done"
        );
        cancelled
    }
}
