//! Job audit logging utilities.

use crate::state_store::{JobAuditEventType, JobStateStore};
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

/// Writes a job's lifecycle events to the audit log of the state database.
///
/// Audit failures are logged and otherwise ignored; they never fail a job.
pub struct JobAuditLogger {
    state_store: Arc<dyn JobStateStore>,
    job_id: String,
    start_time: Instant,
}

impl JobAuditLogger {
    pub fn new(state_store: Arc<dyn JobStateStore>, job_id: &str) -> Self {
        Self {
            state_store,
            job_id: job_id.to_string(),
            start_time: Instant::now(),
        }
    }

    fn log(
        &self,
        event_type: JobAuditEventType,
        duration_ms: Option<i64>,
        details: Option<&serde_json::Value>,
        error: Option<&str>,
    ) {
        if let Err(e) =
            self.state_store
                .log_job_audit(&self.job_id, event_type, duration_ms, details, error)
        {
            warn!("Failed to write audit entry for {}: {}", self.job_id, e);
        }
    }

    pub fn log_started(&self, details: Option<serde_json::Value>) {
        self.log(JobAuditEventType::Started, None, details.as_ref(), None);
    }

    pub fn log_completed(&self, details: Option<serde_json::Value>) {
        self.log(
            JobAuditEventType::Completed,
            Some(self.elapsed_ms()),
            details.as_ref(),
            None,
        );
    }

    /// The job did not run because another worker owned its work.
    pub fn log_skipped(&self, details: Option<serde_json::Value>) {
        self.log(
            JobAuditEventType::Skipped,
            Some(self.elapsed_ms()),
            details.as_ref(),
            None,
        );
    }

    pub fn log_failed(&self, error: &str, details: Option<serde_json::Value>) {
        self.log(
            JobAuditEventType::Failed,
            Some(self.elapsed_ms()),
            details.as_ref(),
            Some(error),
        );
    }

    pub fn elapsed_ms(&self) -> i64 {
        self.start_time.elapsed().as_millis() as i64
    }
}
