//! Read access to the inventory system of record.
//!
//! The cache is the only caller; it invokes the source from reload paths,
//! never while answering a schedule request.

mod memory;
mod postgres;

use async_trait::async_trait;
use hostsched_api::ResType;

use crate::candidate::{Candidate, InstanceGroup};
use crate::error::SourceError;

pub use memory::{MemorySource, SeedData};
pub use postgres::{PgCandidateSource, PgSourceConfig};

#[async_trait]
pub trait CandidateSource: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Fetch the given candidates. Ids that no longer exist are absent from
    /// the result.
    async fn fetch_by_ids(&self, res_type: ResType, ids: &[String]) -> Result<Vec<Candidate>, SourceError>;

    async fn fetch_all(&self, res_type: ResType) -> Result<Vec<Candidate>, SourceError>;

    /// Fetch instance groups, all of them when `ids` is `None`.
    async fn fetch_instance_groups(&self, ids: Option<&[String]>) -> Result<Vec<InstanceGroup>, SourceError>;

    async fn health_check(&self) -> Result<(), SourceError>;
}
