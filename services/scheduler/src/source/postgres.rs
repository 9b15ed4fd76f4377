use std::collections::BTreeMap;

use async_trait::async_trait;
use hostsched_api::ResType;
use std::time::Duration;

use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{debug, info, instrument, warn};

use super::CandidateSource;
use crate::candidate::{BaremetalDesc, Candidate, HostDesc, InstanceGroup, NetworkDesc, StorageDesc};
use crate::error::SourceError;

/// Connection settings for the read-only inventory database.
#[derive(Debug, Clone)]
pub struct PgSourceConfig {
    pub database_url: String,
    /// Reload batches run one query each; a few connections are plenty.
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PgSourceConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/inventory".to_string(),
            max_connections: 4,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

const HOST_COLUMNS: &str = r#"
    id, name, zone_id, pool_id, region_id, node_name, host_type, enabled, status,
    cpu_count, reserved_cpus, cpu_cmtbound, running_cpu,
    mem_size_mb, mem_reserved_mb, mem_cmtbound, running_mem_mb,
    storages, networks, isolated_devices_free, schedtags, instance_group_guests
"#;

const BAREMETAL_COLUMNS: &str = r#"
    id, name, zone_id, pool_id, region_id, enabled, status, allocated,
    cpu_count, mem_size_mb, storage_size_mb, networks, schedtags
"#;

struct HostRow(HostDesc);

impl<'r> sqlx::FromRow<'r, PgRow> for HostRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let storages: Json<Vec<StorageDesc>> = row.try_get("storages")?;
        let networks: Json<Vec<NetworkDesc>> = row.try_get("networks")?;
        let schedtags: Json<Vec<String>> = row.try_get("schedtags")?;
        let guests: Json<BTreeMap<String, i64>> = row.try_get("instance_group_guests")?;

        Ok(Self(HostDesc {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            zone_id: row.try_get("zone_id")?,
            pool_id: row.try_get("pool_id")?,
            region_id: row.try_get("region_id")?,
            node_name: row.try_get("node_name")?,
            host_type: row.try_get("host_type")?,
            enabled: row.try_get("enabled")?,
            status: row.try_get("status")?,
            cpu_count: row.try_get("cpu_count")?,
            reserved_cpus: row.try_get::<Option<String>, _>("reserved_cpus")?.unwrap_or_default(),
            reserved_cpu_cores: 0,
            cpu_cmtbound: row.try_get("cpu_cmtbound")?,
            running_cpu: row.try_get("running_cpu")?,
            mem_size_mb: row.try_get("mem_size_mb")?,
            mem_reserved_mb: row.try_get("mem_reserved_mb")?,
            mem_cmtbound: row.try_get("mem_cmtbound")?,
            running_mem_mb: row.try_get("running_mem_mb")?,
            storages: storages.0,
            networks: networks.0,
            isolated_devices_free: row.try_get("isolated_devices_free")?,
            schedtags: schedtags.0,
            instance_group_guests: guests.0,
        }))
    }
}

struct BaremetalRow(BaremetalDesc);

impl<'r> sqlx::FromRow<'r, PgRow> for BaremetalRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let networks: Json<Vec<NetworkDesc>> = row.try_get("networks")?;
        let schedtags: Json<Vec<String>> = row.try_get("schedtags")?;

        Ok(Self(BaremetalDesc {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            zone_id: row.try_get("zone_id")?,
            pool_id: row.try_get("pool_id")?,
            region_id: row.try_get("region_id")?,
            enabled: row.try_get("enabled")?,
            status: row.try_get("status")?,
            allocated: row.try_get("allocated")?,
            cpu_count: row.try_get("cpu_count")?,
            mem_size_mb: row.try_get("mem_size_mb")?,
            storage_size_mb: row.try_get("storage_size_mb")?,
            networks: networks.0,
            schedtags: schedtags.0,
        }))
    }
}

struct GroupRow(InstanceGroup);

impl<'r> sqlx::FromRow<'r, PgRow> for GroupRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self(InstanceGroup {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            granularity: row.try_get("granularity")?,
            force_dispersion: row.try_get("force_dispersion")?,
        }))
    }
}

/// Candidate source backed by the inventory tables `hosts`, `baremetals`
/// and `instance_groups`.
#[derive(Clone)]
pub struct PgCandidateSource {
    pool: PgPool,
}

impl PgCandidateSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &PgSourceConfig) -> Result<Self, SourceError> {
        info!(
            max_connections = config.max_connections,
            "Connecting to inventory database"
        );
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await
            .map_err(|e| SourceError::Unavailable(format!("connect to inventory database: {e}")))?;
        Ok(Self::new(pool))
    }

    fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn query_hosts(&self, ids: Option<&[String]>) -> Result<Vec<Candidate>, SourceError> {
        let rows: Vec<HostRow> = match ids {
            Some(ids) => {
                sqlx::query_as(&format!("SELECT {HOST_COLUMNS} FROM hosts WHERE id = ANY($1)"))
                    .bind(ids)
                    .fetch_all(self.pool())
                    .await?
            }
            None => {
                sqlx::query_as(&format!("SELECT {HOST_COLUMNS} FROM hosts ORDER BY id"))
                    .fetch_all(self.pool())
                    .await?
            }
        };
        Ok(prepare_hosts(rows.into_iter().map(|row| row.0)))
    }

    async fn query_baremetals(&self, ids: Option<&[String]>) -> Result<Vec<Candidate>, SourceError> {
        let rows: Vec<BaremetalRow> = match ids {
            Some(ids) => {
                sqlx::query_as(&format!(
                    "SELECT {BAREMETAL_COLUMNS} FROM baremetals WHERE id = ANY($1)"
                ))
                .bind(ids)
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query_as(&format!("SELECT {BAREMETAL_COLUMNS} FROM baremetals ORDER BY id"))
                    .fetch_all(self.pool())
                    .await?
            }
        };
        Ok(rows.into_iter().map(|row| Candidate::Baremetal(row.0)).collect())
    }
}

/// Hosts whose derived fields do not parse are left out, so a reload
/// treats them as gone instead of failing the whole fetch.
fn prepare_hosts(hosts: impl IntoIterator<Item = HostDesc>) -> Vec<Candidate> {
    hosts
        .into_iter()
        .filter_map(|mut host| match host.prepare() {
            Ok(()) => Some(Candidate::Host(host)),
            Err(e) => {
                warn!(host_id = %host.id, error = %e, "Skipping host with invalid inventory row");
                None
            }
        })
        .collect()
}

#[async_trait]
impl CandidateSource for PgCandidateSource {
    fn name(&self) -> &'static str {
        "postgres"
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn fetch_by_ids(&self, res_type: ResType, ids: &[String]) -> Result<Vec<Candidate>, SourceError> {
        let candidates = match res_type {
            ResType::Host => self.query_hosts(Some(ids)).await?,
            ResType::Baremetal => self.query_baremetals(Some(ids)).await?,
        };
        debug!(found = candidates.len(), "Fetched candidates by id");
        Ok(candidates)
    }

    #[instrument(skip(self))]
    async fn fetch_all(&self, res_type: ResType) -> Result<Vec<Candidate>, SourceError> {
        match res_type {
            ResType::Host => self.query_hosts(None).await,
            ResType::Baremetal => self.query_baremetals(None).await,
        }
    }

    async fn fetch_instance_groups(&self, ids: Option<&[String]>) -> Result<Vec<InstanceGroup>, SourceError> {
        let rows: Vec<GroupRow> = match ids {
            Some(ids) => {
                sqlx::query_as(
                    "SELECT id, name, granularity, force_dispersion FROM instance_groups WHERE id = ANY($1)",
                )
                .bind(ids)
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query_as("SELECT id, name, granularity, force_dispersion FROM instance_groups")
                    .fetch_all(self.pool())
                    .await?
            }
        };
        Ok(rows.into_iter().map(|row| row.0).collect())
    }

    async fn health_check(&self) -> Result<(), SourceError> {
        sqlx::query("SELECT 1").execute(self.pool()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::testing::host;

    #[test]
    fn test_bad_host_rows_are_skipped() {
        let mut bad = host("h2", 8, 1024);
        bad.reserved_cpus = "0-20000000".into();
        let mut good = host("h1", 8, 1024);
        good.reserved_cpus = "0-1".into();

        let hosts = prepare_hosts([good, bad, host("h3", 8, 1024)]);
        let ids: Vec<_> = hosts.iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec!["h1", "h3"]);
        assert!(matches!(&hosts[0], Candidate::Host(h) if h.reserved_cpu_count() == 2));
    }

    #[test]
    fn test_config_defaults() {
        let config = PgSourceConfig::default();
        assert!(config.database_url.starts_with("postgres://"));
        assert_eq!(config.max_connections, 4);
    }
}
