//! Finished Builds Sync Library
//!
//! Incrementally copies finished CI builds from the transactional database
//! into a columnar analytics store. This library exposes the internal modules
//! for testing and for the worker binary.

pub mod analytics;
pub mod background_jobs;
pub mod config;
pub mod metrics;
pub mod source_store;
pub mod sqlite_persistence;
pub mod state_store;
pub mod sync;

// Re-export commonly used types for convenience
pub use analytics::{AnalyticsDestination, ClickHouseDestination, SqliteAnalyticsStore};
pub use background_jobs::jobs::{FinishedBuildsSyncJob, InvocationResult};
pub use source_store::{BuildRecords, ShardSpec, SqliteSourceStore, SyncEventLog};
pub use state_store::{JobStateStore, LockService, SqliteStateStore};
pub use sync::{RunSummary, SyncError, SyncOrchestrator, SyncSettings};
