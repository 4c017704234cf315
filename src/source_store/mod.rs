//! The transactional CI database: builds, their joined attributes, and the
//! change event log announcing finished builds.

pub mod demo;
mod models;
mod schema;
mod sqlite_source_store;

pub use models::*;
pub use schema::SOURCE_VERSIONED_SCHEMAS;
pub use sqlite_source_store::SqliteSourceStore;

use anyhow::Result;

/// Durable log of "finished build pending copy" events.
pub trait SyncEventLog: Send + Sync {
    /// Up to `limit` unprocessed events owned by `shard`, ordered by
    /// `(ready_at, source_id)`, strictly after `after` when given.
    fn fetch_unprocessed_after(
        &self,
        shard: ShardSpec,
        after: Option<EventKey>,
        limit: usize,
    ) -> Result<Vec<SyncEvent>>;

    /// Flips the events with exactly these keys to processed.
    /// Returns how many rows changed; already processed rows are left alone.
    fn mark_processed(&self, keys: &[EventKey]) -> Result<usize>;

    /// Number of unprocessed events, optionally restricted to one shard.
    fn count_unprocessed(&self, shard: Option<ShardSpec>) -> Result<usize>;
}

/// Bulk lookups used to denormalize a page of builds.
///
/// Every method is a single query whatever the number of ids, so enriching a
/// page costs a fixed number of round trips.
pub trait BuildRecords: Send + Sync {
    fn builds_by_ids(&self, ids: &[i64]) -> Result<Vec<BuildRecord>>;
    fn project_namespaces(&self, project_ids: &[i64]) -> Result<Vec<ProjectNamespace>>;
    fn runners_by_ids(&self, ids: &[i64]) -> Result<Vec<RunnerRecord>>;
    fn runner_tags(&self, runner_ids: &[i64]) -> Result<Vec<RunnerTag>>;
    fn runner_managers_by_ids(&self, ids: &[i64]) -> Result<Vec<RunnerManagerRecord>>;
    /// Retried builds per `(pipeline_id, name)` for the given pipelines.
    fn retried_counts(&self, pipeline_ids: &[i64]) -> Result<Vec<RetryCount>>;
    fn artifact_summaries(&self, build_ids: &[i64]) -> Result<Vec<ArtifactSummary>>;
}
