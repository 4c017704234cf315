//! Job audit log cleanup background job.
//!
//! Periodically deletes job audit entries older than the configured
//! retention period.

use crate::background_jobs::{
    context::JobContext,
    job::{BackgroundJob, JobError, JobOutcome, JobSchedule, ShutdownBehavior},
};
use chrono::Utc;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::info;

pub struct AuditLogCleanupJob {
    retention_days: u64,
}

impl AuditLogCleanupJob {
    pub fn new(retention_days: u64) -> Self {
        Self { retention_days }
    }
}

impl BackgroundJob for AuditLogCleanupJob {
    fn id(&self) -> &'static str {
        "audit_log_cleanup"
    }

    fn name(&self) -> &'static str {
        "Audit Log Cleanup"
    }

    fn description(&self) -> &'static str {
        "Delete old job audit entries based on retention policy"
    }

    fn schedule(&self) -> JobSchedule {
        JobSchedule::Interval(Duration::from_secs(24 * 60 * 60))
    }

    fn shutdown_behavior(&self) -> ShutdownBehavior {
        ShutdownBehavior::Cancellable
    }

    fn execute_with_params(
        &self,
        ctx: &JobContext,
        _params: Option<JsonValue>,
    ) -> Result<JobOutcome, JobError> {
        if ctx.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let cutoff = Utc::now().timestamp() - (self.retention_days as i64 * 24 * 60 * 60);
        info!(
            "Cleaning up job audit entries older than {} days (cutoff: {})",
            self.retention_days, cutoff
        );

        let deleted = ctx
            .state_store
            .cleanup_old_job_audit_entries(cutoff)
            .map_err(|e| JobError::ExecutionFailed(e.to_string()))?;

        if deleted > 0 {
            info!("Deleted {} old job audit entries", deleted);
        }
        Ok(JobOutcome::Idle)
    }
}
