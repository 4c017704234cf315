mod models;
mod schema;
mod sqlite_state_store;

pub use models::*;
pub use schema::STATE_VERSIONED_SCHEMAS;
pub use sqlite_state_store::SqliteStateStore;

use anyhow::Result;
use std::time::Duration;

/// "Set if not exists, with TTL" mutual exclusion shared by all workers.
pub trait LockService: Send + Sync {
    /// Single attempt. Returns true when `holder_id` now owns `key`, either
    /// because nobody held it or because the previous lease expired.
    fn try_acquire(&self, key: &str, holder_id: &str, ttl: Duration) -> Result<bool>;
    /// Deletes the lease only if `holder_id` still owns it.
    fn release(&self, key: &str, holder_id: &str) -> Result<bool>;
    fn current_lease(&self, key: &str) -> Result<Option<LeaseInfo>>;
}

pub trait JobStateStore: Send + Sync {
    fn record_job_start(&self, job_id: &str, triggered_by: &str) -> Result<i64>;
    fn record_job_finish(
        &self,
        run_id: i64,
        status: JobRunStatus,
        error_message: Option<String>,
    ) -> Result<()>;
    fn get_running_jobs(&self) -> Result<Vec<JobRun>>;
    fn get_job_history(&self, job_id: &str, limit: usize) -> Result<Vec<JobRun>>;
    fn mark_stale_jobs_failed(&self) -> Result<usize>;

    // Job audit log
    fn log_job_audit(
        &self,
        job_id: &str,
        event_type: JobAuditEventType,
        duration_ms: Option<i64>,
        details: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> Result<i64>;
    fn get_job_audit_log_by_job(
        &self,
        job_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<JobAuditEntry>>;
    fn cleanup_old_job_audit_entries(&self, before_timestamp: i64) -> Result<usize>;
}
