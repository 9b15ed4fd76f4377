//! hostsched placement scheduler.
//!
//! The crate ships the `hostsched` binary; the library surface exists for
//! integration tests and embedding.

pub mod api;
pub mod cache;
pub mod candidate;
pub mod config;
pub mod error;
pub mod expire;
pub mod generic;
pub mod history;
pub mod manager;
pub mod pending_usage;
pub mod placement;
pub mod reload_cancel;
pub mod source;
pub mod state;
pub mod task;
pub mod unit;

pub use error::{SchedError, SchedResult};
pub use manager::{SchedulerConfig, SchedulerManager, Workers};
