use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, instrument};

use super::PendingUsageManager;

#[derive(Debug, Clone)]
pub struct PendingUsageGcConfig {
    pub interval: Duration,
    /// Session usages older than this are returned to their hosts.
    pub ttl: Duration,
}

impl Default for PendingUsageGcConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            ttl: Duration::from_secs(600),
        }
    }
}

/// Periodically drops session usages that were never confirmed.
pub struct PendingUsageGcWorker {
    ledger: Arc<PendingUsageManager>,
    config: PendingUsageGcConfig,
}

impl PendingUsageGcWorker {
    pub fn new(ledger: Arc<PendingUsageManager>, config: PendingUsageGcConfig) -> Self {
        Self { ledger, config }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            ttl_secs = self.config.ttl.as_secs(),
            "Starting pending usage gc worker"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_gc();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Pending usage gc worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    fn run_gc(&self) -> usize {
        let cancelled = self.ledger.gc_expired_session_usages(self.config.ttl);
        debug!(
            cancelled,
            remaining = self.ledger.session_count(),
            "Pending usage gc pass complete"
        );
        cancelled
    }
}
