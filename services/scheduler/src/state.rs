//! Application state shared across request handlers.

use std::sync::Arc;

use crate::manager::SchedulerManager;

/// Passed to every handler through axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    scheduler: Arc<SchedulerManager>,
}

impl AppState {
    pub fn new(scheduler: Arc<SchedulerManager>) -> Self {
        Self {
            inner: Arc::new(AppStateInner { scheduler }),
        }
    }

    pub fn scheduler(&self) -> &Arc<SchedulerManager> {
        &self.inner.scheduler
    }
}
