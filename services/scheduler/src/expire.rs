//! Expire queue: batches stale-host notifications into partial reloads.
//!
//! Producers never block on `add`; a full queue drops the args. The single
//! consumer drains everything queued at each wake-up, merges the ids, and
//! reloads each resource type once per batch.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use hostsched_api::{ExpireArgs, ResType};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, instrument, warn};

use crate::cache::CandidateCache;
use crate::error::{SchedError, SchedResult};
use crate::pending_usage::PendingUsageManager;

#[derive(Debug, Clone)]
pub struct ExpireConfig {
    /// Tick of the consumer loop.
    pub interval: Duration,
    /// Queued args that force a drain before the next tick.
    pub deal_length: usize,
    pub queue_size: usize,
    /// Upper bound for the reloads of one batch.
    pub timeout: Duration,
}

impl Default for ExpireConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            deal_length: 10,
            queue_size: 10_000,
            timeout: Duration::from_secs(60),
        }
    }
}

enum ExpireCommand {
    Expire(ExpireArgs),
    /// Flush now; the sender is acked once the batch is applied.
    Trigger(oneshot::Sender<()>),
}

/// Producer handle of the expire queue.
#[derive(Clone)]
pub struct ExpireManager {
    tx: mpsc::Sender<ExpireCommand>,
}

impl ExpireManager {
    pub fn new(
        cache: Arc<CandidateCache>,
        ledger: Arc<PendingUsageManager>,
        config: ExpireConfig,
    ) -> (Self, ExpireWorker) {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        let worker = ExpireWorker {
            rx,
            cache,
            ledger,
            config,
        };
        (Self { tx }, worker)
    }

    /// Queue `args`; returns false when the queue is full or closed.
    pub fn add(&self, args: ExpireArgs) -> bool {
        match self.tx.try_send(ExpireCommand::Expire(args)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Expire queue full, dropping expire args");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Expire queue closed, dropping expire args");
                false
            }
        }
    }

    /// Force a flush and wait until everything queued before it is applied.
    pub async fn trigger(&self) -> SchedResult<()> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(ExpireCommand::Trigger(ack))
            .await
            .map_err(|_| SchedError::QueueClosed("expire".into()))?;
        done.await
            .map_err(|_| SchedError::QueueClosed("expire".into()))
    }
}

/// Args and waiters collected since the last flush.
#[derive(Default)]
struct Batch {
    args: Vec<ExpireArgs>,
    waiters: Vec<oneshot::Sender<()>>,
}

impl Batch {
    fn push(&mut self, cmd: ExpireCommand) {
        match cmd {
            ExpireCommand::Expire(args) => self.args.push(args),
            ExpireCommand::Trigger(ack) => self.waiters.push(ack),
        }
    }

    /// Dirty ids of one resource type, de-duplicated in first-seen order.
    fn merged_ids(&self, res_type: ResType) -> Vec<String> {
        let mut seen = HashSet::new();
        self.args
            .iter()
            .flat_map(|a| a.ids(res_type))
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect()
    }
}

/// Consumer of the expire queue.
pub struct ExpireWorker {
    rx: mpsc::Receiver<ExpireCommand>,
    cache: Arc<CandidateCache>,
    ledger: Arc<PendingUsageManager>,
    config: ExpireConfig,
}

impl ExpireWorker {
    #[instrument(skip(self, shutdown))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            deal_length = self.config.deal_length,
            "Starting expire worker"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;
        let mut batch = Batch::default();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.drain_available(&mut batch);
                    self.flush(std::mem::take(&mut batch)).await;
                }
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => {
                        let eager = matches!(cmd, ExpireCommand::Trigger(_));
                        batch.push(cmd);
                        if eager || batch.args.len() >= self.config.deal_length {
                            self.drain_available(&mut batch);
                            self.flush(std::mem::take(&mut batch)).await;
                        }
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

        self.rx.close();
        self.drain_available(&mut batch);
        self.flush(batch).await;
        info!("Expire worker shutting down");
    }

    fn drain_available(&mut self, batch: &mut Batch) {
        while let Ok(cmd) = self.rx.try_recv() {
            batch.push(cmd);
        }
    }

    /// Reload the merged ids plus whatever the cache has marked dirty, then
    /// release the session usages those reloads made redundant.
    async fn flush(&self, batch: Batch) {
        let host_ids = self.with_dirty(ResType::Host, batch.merged_ids(ResType::Host));
        let baremetal_ids = self.with_dirty(ResType::Baremetal, batch.merged_ids(ResType::Baremetal));

        if host_ids.is_empty() && baremetal_ids.is_empty() {
            debug!(waiters = batch.waiters.len(), "Expire batch empty");
            ack(batch.waiters);
            return;
        }

        let cutoff = self.ledger.set_reload_start_time();
        let joined = tokio::time::timeout(self.config.timeout, async {
            tokio::join!(
                self.reload(ResType::Host, &host_ids),
                self.reload(ResType::Baremetal, &baremetal_ids),
            )
        })
        .await;

        match joined {
            Ok((hosts, baremetals)) => {
                let released: usize = batch
                    .args
                    .iter()
                    .filter_map(|args| {
                        let session = args.session_id.as_deref()?;
                        let ids: Vec<String> = ResType::ALL
                            .iter()
                            .flat_map(|t| args.ids(*t).iter().cloned())
                            .collect();
                        Some(self.ledger.clear_session_usages_before(
                            cutoff,
                            Some(session),
                            Some(ids.as_slice()),
                        ))
                    })
                    .sum();
                info!(
                    args = batch.args.len(),
                    hosts,
                    baremetals,
                    released,
                    "Expire batch applied"
                );
            }
            Err(_) => warn!(
                timeout_secs = self.config.timeout.as_secs(),
                "Expire batch reload timed out"
            ),
        }

        ack(batch.waiters);
    }

    /// Append ids the cache has marked dirty that the batch does not name.
    fn with_dirty(&self, res_type: ResType, mut ids: Vec<String>) -> Vec<String> {
        let known: HashSet<String> = ids.iter().cloned().collect();
        ids.extend(
            self.cache
                .dirty_ids(res_type)
                .into_iter()
                .filter(|id| !known.contains(id)),
        );
        ids
    }

    async fn reload(&self, res_type: ResType, ids: &[String]) -> usize {
        if ids.is_empty() {
            return 0;
        }
        let report = self.cache.reload(res_type, ids).await;
        if let Some(e) = &report.last_error {
            warn!(
                res_type = %res_type,
                failed = report.failed.len(),
                error = %e,
                "Expire reload partially failed"
            );
        }
        self.cache.clear_dirty(res_type, ids);
        report.refreshed.len()
    }
}

fn ack(waiters: Vec<oneshot::Sender<()>>) {
    for waiter in waiters {
        let _ = waiter.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::testing::host;
    use crate::candidate::{Candidate, InstanceGroup};
    use crate::error::SourceError;
    use crate::source::{CandidateSource, MemorySource};
    use async_trait::async_trait;
    use hostsched_api::{CandidateResource, HostPick, ScheduleInput};
    use parking_lot::Mutex;

    /// Records every id the cache asks for.
    struct CountingSource {
        inner: MemorySource,
        fetched: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CandidateSource for CountingSource {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn fetch_by_ids(&self, res_type: ResType, ids: &[String]) -> Result<Vec<Candidate>, SourceError> {
            self.fetched.lock().extend(ids.iter().cloned());
            self.inner.fetch_by_ids(res_type, ids).await
        }

        async fn fetch_all(&self, res_type: ResType) -> Result<Vec<Candidate>, SourceError> {
            self.inner.fetch_all(res_type).await
        }

        async fn fetch_instance_groups(&self, ids: Option<&[String]>) -> Result<Vec<InstanceGroup>, SourceError> {
            self.inner.fetch_instance_groups(ids).await
        }

        async fn health_check(&self) -> Result<(), SourceError> {
            Ok(())
        }
    }

    async fn setup(config: ExpireConfig) -> (Arc<CountingSource>, Arc<CandidateCache>, Arc<PendingUsageManager>, ExpireManager, ExpireWorker) {
        let inner = MemorySource::new();
        for id in ["h1", "h2", "h3"] {
            inner.upsert(host(id, 8, 8192)).unwrap();
        }
        let source = Arc::new(CountingSource {
            inner,
            fetched: Mutex::new(Vec::new()),
        });
        let cache = Arc::new(CandidateCache::new(source.clone()));
        cache.load_all().await.unwrap();
        let ledger = Arc::new(PendingUsageManager::new());
        let (manager, worker) = ExpireManager::new(cache.clone(), ledger.clone(), config);
        (source, cache, ledger, manager, worker)
    }

    fn args(session: Option<&str>, hosts: &[&str]) -> ExpireArgs {
        ExpireArgs {
            session_id: session.map(str::to_string),
            dirty_hosts: hosts.iter().map(|s| s.to_string()).collect(),
            dirty_baremetals: vec![],
        }
    }

    fn slow_ticks() -> ExpireConfig {
        ExpireConfig {
            interval: Duration::from_secs(3600),
            deal_length: 100,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_overlapping_args_reload_each_id_once() {
        let (source, _cache, _ledger, manager, worker) = setup(slow_ticks()).await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(shutdown_rx));

        assert!(manager.add(args(None, &["h1", "h2"])));
        assert!(manager.add(args(None, &["h2", "h3"])));
        assert!(manager.add(args(None, &["h1"])));
        manager.trigger().await.unwrap();

        let mut fetched = source.fetched.lock().clone();
        fetched.sort();
        assert_eq!(fetched, vec!["h1", "h2", "h3"]);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_dirty_marks_are_reloaded_and_cleared() {
        let (source, cache, _ledger, manager, worker) = setup(slow_ticks()).await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(shutdown_rx));

        cache.set_candidate_dirty(ResType::Host, "h2");
        manager.trigger().await.unwrap();

        assert_eq!(source.fetched.lock().as_slice(), ["h2".to_string()]);
        assert_eq!(cache.dirty_count(ResType::Host, "h2"), 0);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_session_usage_released_after_reload() {
        let (_source, _cache, ledger, manager, worker) = setup(slow_ticks()).await;
        let input = ScheduleInput {
            session_id: Some("s1".into()),
            vcpu_count: 2,
            ..Default::default()
        };
        ledger.add_pending_usage(
            &input,
            &CandidateResource {
                session_id: "s1".into(),
                host: HostPick {
                    id: "h1".into(),
                    name: "h1-name".into(),
                    res_type: ResType::Host,
                    zone_id: None,
                    storage_ids: vec![],
                    network_ids: vec![],
                },
                backup: None,
            },
        );
        assert!(ledger.get_pending_usage("h1").is_some());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(5)).await;
        manager.add(args(Some("s1"), &["h1"]));
        manager.trigger().await.unwrap();

        assert!(ledger.get_pending_usage("h1").is_none());
        assert!(ledger.get_session_usage("s1", "h1").is_none());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_deal_length_flushes_without_trigger() {
        let (source, _cache, _ledger, manager, worker) = setup(ExpireConfig {
            deal_length: 2,
            ..slow_ticks()
        })
        .await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(shutdown_rx));

        assert!(manager.add(args(None, &["h1"])));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(source.fetched.lock().is_empty());

        assert!(manager.add(args(None, &["h2"])));
        let mut flushed = false;
        for _ in 0..100 {
            if source.fetched.lock().len() == 2 {
                flushed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(flushed, "second args did not force a flush");

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_flushes_queued_args() {
        let (source, _cache, _ledger, manager, worker) = setup(ExpireConfig {
            interval: Duration::from_secs(1),
            deal_length: 100,
            ..Default::default()
        })
        .await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(shutdown_rx));

        assert!(manager.add(args(None, &["h3"])));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(source.fetched.lock().is_empty());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(source.fetched.lock().as_slice(), ["h3".to_string()]);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_full_queue_drops() {
        let (_source, _cache, _ledger, manager, _worker) = setup(ExpireConfig {
            queue_size: 1,
            ..slow_ticks()
        })
        .await;
        assert!(manager.add(args(None, &["h1"])));
        assert!(!manager.add(args(None, &["h2"])));
    }

    #[tokio::test]
    async fn test_shutdown_flushes_last_batch() {
        let (source, _cache, _ledger, manager, worker) = setup(slow_ticks()).await;
        manager.add(args(None, &["h3"]));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        shutdown_tx.send(true).unwrap();
        worker.run(shutdown_rx).await;

        assert_eq!(source.fetched.lock().as_slice(), ["h3".to_string()]);
    }

    #[tokio::test]
    async fn test_trigger_fails_once_worker_is_gone() {
        let (_source, _cache, _ledger, manager, worker) = setup(slow_ticks()).await;
        drop(worker);
        assert!(matches!(manager.trigger().await, Err(SchedError::QueueClosed(_))));
    }
}
