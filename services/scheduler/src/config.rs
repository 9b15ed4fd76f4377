use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::expire::ExpireConfig;
use crate::manager::SchedulerConfig;
use crate::pending_usage::PendingUsageGcConfig;
use crate::source::PgSourceConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    /// Serve from the in-memory source instead of Postgres.
    pub dev_mode: bool,
    pub seed_file: Option<PathBuf>,
    pub database: PgSourceConfig,
    pub scheduler: SchedulerConfig,
}

/// Parse `name` when set, `default` otherwise.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("invalid value for {name}: {value:?}")),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("HOSTSCHED_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8897".to_string())
            .parse()
            .context("invalid HOSTSCHED_LISTEN_ADDR")?;

        let log_level = std::env::var("HOSTSCHED_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let dev_mode = std::env::var("HOSTSCHED_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let seed_file = std::env::var("HOSTSCHED_SEED_FILE").ok().map(PathBuf::from);

        let db_defaults = PgSourceConfig::default();
        let database = PgSourceConfig {
            database_url: std::env::var("HOSTSCHED_DATABASE_URL")
                .or_else(|_| std::env::var("DATABASE_URL"))
                .unwrap_or(db_defaults.database_url),
            max_connections: env_or("HOSTSCHED_DB_MAX_CONNECTIONS", db_defaults.max_connections)?,
            acquire_timeout: Duration::from_secs(env_or(
                "HOSTSCHED_DB_ACQUIRE_TIMEOUT_SECS",
                db_defaults.acquire_timeout.as_secs(),
            )?),
        };

        let defaults = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            reload_interval: Duration::from_secs(env_or(
                "HOSTSCHED_RELOAD_INTERVAL_SECS",
                defaults.reload_interval.as_secs(),
            )?),
            expire: ExpireConfig {
                interval: Duration::from_millis(env_or(
                    "HOSTSCHED_EXPIRE_INTERVAL_MS",
                    defaults.expire.interval.as_millis() as u64,
                )?),
                deal_length: env_or("HOSTSCHED_EXPIRE_DEAL_LENGTH", defaults.expire.deal_length)?,
                queue_size: env_or("HOSTSCHED_EXPIRE_QUEUE_SIZE", defaults.expire.queue_size)?,
                timeout: Duration::from_secs(env_or(
                    "HOSTSCHED_EXPIRE_TIMEOUT_SECS",
                    defaults.expire.timeout.as_secs(),
                )?),
            },
            reload_cancel_queue_size: env_or(
                "HOSTSCHED_RELOAD_CANCEL_QUEUE_SIZE",
                defaults.reload_cancel_queue_size,
            )?,
            pending_gc: PendingUsageGcConfig {
                interval: Duration::from_secs(env_or(
                    "HOSTSCHED_PENDING_GC_INTERVAL_SECS",
                    defaults.pending_gc.interval.as_secs(),
                )?),
                ttl: Duration::from_secs(env_or(
                    "HOSTSCHED_PENDING_TTL_SECS",
                    defaults.pending_gc.ttl.as_secs(),
                )?),
            },
            history_limit: env_or("HOSTSCHED_HISTORY_LIMIT", defaults.history_limit)?,
            predicate_parallelism: env_or(
                "HOSTSCHED_PREDICATE_PARALLELISM",
                defaults.predicate_parallelism,
            )?,
            task_queue_size: env_or("HOSTSCHED_TASK_QUEUE_SIZE", defaults.task_queue_size)?,
            max_schedule_count: env_or(
                "HOSTSCHED_MAX_SCHEDULE_COUNT",
                defaults.max_schedule_count,
            )?,
        };

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            seed_file,
            database,
            scheduler,
        })
    }
}
