//! Periodic full reload of the candidate cache.
//!
//! Dirty marks and the expire queue keep the cache fresh under normal load;
//! this loop catches whatever invalidation was missed.

use std::sync::Arc;
use std::time::Duration;

use hostsched_api::ResType;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use super::CandidateCache;
use crate::pending_usage::PendingUsageManager;

pub struct CandidateReloadWorker {
    cache: Arc<CandidateCache>,
    ledger: Arc<PendingUsageManager>,
    interval: Duration,
}

impl CandidateReloadWorker {
    pub fn new(cache: Arc<CandidateCache>, ledger: Arc<PendingUsageManager>, interval: Duration) -> Self {
        Self {
            cache,
            ledger,
            interval,
        }
    }

    /// Run the reload loop until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting candidate reload worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        // Startup already loaded everything; wait a full period.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.reload_pass().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Candidate reload worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One full reload of every resource type. Failures are retried next period.
    async fn reload_pass(&self) -> usize {
        let mut total = 0;
        for res_type in ResType::ALL {
            self.ledger.set_reload_all_start_time();
            match self.cache.reload_all(res_type).await {
                Ok(count) => total += count,
                Err(e) => error!(res_type = %res_type, error = %e, "Periodic candidate reload failed"),
            }
        }
        if let Err(e) = self.cache.reload_instance_groups().await {
            warn!(error = %e, "Instance group reload failed");
        }
        self.ledger.prune_idle_host_locks();
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::testing::host;
    use crate::source::MemorySource;

    #[tokio::test]
    async fn test_reload_pass_picks_up_new_hosts() {
        let source = Arc::new(MemorySource::new());
        source.upsert(host("h1", 4, 1024)).unwrap();
        let cache = Arc::new(CandidateCache::new(source.clone()));
        let ledger = Arc::new(PendingUsageManager::new());
        let worker = CandidateReloadWorker::new(cache.clone(), ledger.clone(), Duration::from_secs(60));

        assert_eq!(worker.reload_pass().await, 1);
        source.upsert(host("h2", 4, 1024)).unwrap();
        assert_eq!(worker.reload_pass().await, 2);
        assert!(cache.get_candidate("h2").is_some());
        assert!(ledger.get_reload_all_start_time().is_some());
    }

    #[tokio::test]
    async fn test_worker_stops_on_shutdown() {
        let cache = Arc::new(CandidateCache::new(Arc::new(MemorySource::new())));
        let worker = CandidateReloadWorker::new(
            cache,
            Arc::new(PendingUsageManager::new()),
            Duration::from_secs(60),
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { worker.run(rx).await });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
