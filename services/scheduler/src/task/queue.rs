//! Per (resource type, pool) executor queues.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use hostsched_api::ResType;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ExecutorContext, Task, TaskExecutor};
use crate::error::{SchedError, SchedResult};

/// Pool name used for requests that do not name one.
pub const DEFAULT_POOL: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueKey {
    pub res_type: ResType,
    pub pool: String,
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.res_type, self.pool)
    }
}

/// FIFO of executors, drained by one consumer.
pub struct TaskExecutorQueue {
    key: QueueKey,
    tx: mpsc::Sender<Arc<TaskExecutor>>,
    token: CancellationToken,
}

impl TaskExecutorQueue {
    /// Create the queue and spawn its consumer.
    pub fn spawn(
        key: QueueKey,
        capacity: usize,
        ctx: Arc<ExecutorContext>,
        token: CancellationToken,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(consume(key.clone(), rx, ctx, token.clone()));
        Arc::new(Self { key, tx, token })
    }

    pub fn key(&self) -> &QueueKey {
        &self.key
    }

    /// Enqueue an executor, waiting for room when the queue is full.
    pub async fn submit(&self, executor: Arc<TaskExecutor>) -> SchedResult<()> {
        if self.token.is_cancelled() {
            return Err(SchedError::QueueClosed(self.key.to_string()));
        }
        self.tx
            .send(executor)
            .await
            .map_err(|_| SchedError::QueueClosed(self.key.to_string()))
    }
}

async fn consume(
    key: QueueKey,
    mut rx: mpsc::Receiver<Arc<TaskExecutor>>,
    ctx: Arc<ExecutorContext>,
    token: CancellationToken,
) {
    debug!(queue = %key, "Executor queue started");
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = rx.recv() => match next {
                Some(executor) => executor.execute(&ctx).await,
                None => break,
            },
        }
    }

    rx.close();
    let mut aborted = 0usize;
    while let Ok(executor) = rx.try_recv() {
        executor.abort();
        aborted += 1;
    }
    info!(queue = %key, aborted, "Executor queue stopped");
}

/// Routes executors to their queue, creating queues on first use.
pub struct TaskQueueManager {
    queues: DashMap<QueueKey, Arc<TaskExecutorQueue>>,
    ctx: Arc<ExecutorContext>,
    capacity: usize,
    token: CancellationToken,
}

impl TaskQueueManager {
    pub fn new(ctx: Arc<ExecutorContext>, capacity: usize) -> Self {
        Self {
            queues: DashMap::new(),
            ctx,
            capacity,
            token: CancellationToken::new(),
        }
    }

    pub fn context(&self) -> &Arc<ExecutorContext> {
        &self.ctx
    }

    /// Enqueue every executor of `task`.
    pub async fn add_task(&self, task: &Arc<Task>) -> SchedResult<()> {
        let pool = task.input.pool_id.as_deref().unwrap_or(DEFAULT_POOL);
        for executor in task.executors() {
            let key = QueueKey {
                res_type: executor.res_type,
                pool: pool.to_string(),
            };
            let queue = self
                .queues
                .entry(key.clone())
                .or_insert_with(|| {
                    debug!(queue = %key, "Creating executor queue");
                    TaskExecutorQueue::spawn(key, self.capacity, self.ctx.clone(), self.token.child_token())
                })
                .clone();
            queue.submit(executor.clone()).await?;
        }
        Ok(())
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop every queue; executors still waiting are killed.
    pub fn shutdown(&self) {
        self.token.cancel();
    }
}
