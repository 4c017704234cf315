//! Finished builds sync job.
//!
//! Copies finished builds of one shard from the source database to the
//! analytics store. The worker registers one instance of the job per shard;
//! the `run` command invokes it once.

use crate::background_jobs::{
    audit_logger::JobAuditLogger,
    context::JobContext,
    job::{BackgroundJob, JobError, JobOutcome, JobSchedule, ShutdownBehavior},
};
use crate::source_store::ShardSpec;
use crate::sync::{RunSummary, SyncError, SyncOrchestrator};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const REASON_DB_NOT_CONFIGURED: &str = "db_not_configured";
pub const REASON_INVALID_SHARD: &str = "invalid_shard";
pub const REASON_INVALID_SETTINGS: &str = "invalid_settings";
pub const REASON_SKIPPED: &str = "skipped";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Ok,
    Error,
}

/// What a caller gets back from one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationResult {
    pub status: InvocationStatus,
    pub reason: Option<String>,
    pub payload: Option<RunSummary>,
}

impl InvocationResult {
    pub fn ok(summary: RunSummary) -> Self {
        Self {
            status: InvocationStatus::Ok,
            reason: None,
            payload: Some(summary),
        }
    }

    pub fn error(reason: &str) -> Self {
        Self {
            status: InvocationStatus::Error,
            reason: Some(reason.to_string()),
            payload: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == InvocationStatus::Ok
    }
}

#[derive(Debug, Default, Deserialize)]
struct SyncParams {
    shard_id: Option<u32>,
    shard_count: Option<u32>,
}

pub struct FinishedBuildsSyncJob {
    /// None when no analytics destination is configured.
    orchestrator: Option<Arc<SyncOrchestrator>>,
    shard_count: u32,
    interval: Duration,
}

impl FinishedBuildsSyncJob {
    pub fn new(
        orchestrator: Option<Arc<SyncOrchestrator>>,
        shard_count: u32,
        interval: Duration,
    ) -> Self {
        Self {
            orchestrator,
            shard_count,
            interval,
        }
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    /// Runs one sync pass for `shard_id` of `shard_count`.
    ///
    /// Configuration problems and lease contention come back as an error
    /// result without side effects. Write and store failures are returned as
    /// `Err` so the runner records the run as failed.
    pub fn invoke(&self, shard_id: u32, shard_count: u32) -> Result<InvocationResult, SyncError> {
        let Some(orchestrator) = &self.orchestrator else {
            return Ok(InvocationResult::error(REASON_DB_NOT_CONFIGURED));
        };
        let shard = match ShardSpec::new(shard_id, shard_count) {
            Ok(shard) => shard,
            Err(e) => {
                warn!("Rejecting sync invocation: {}", e);
                return Ok(InvocationResult::error(REASON_INVALID_SHARD));
            }
        };

        match orchestrator.run(shard) {
            Ok(summary) => Ok(InvocationResult::ok(summary)),
            Err(SyncError::LeaseDenied(_)) => Ok(InvocationResult::error(REASON_SKIPPED)),
            Err(SyncError::InvalidShard(_)) => Ok(InvocationResult::error(REASON_INVALID_SHARD)),
            Err(SyncError::Configuration(msg)) => {
                warn!("Sync settings rejected: {}", msg);
                Ok(InvocationResult::error(REASON_INVALID_SETTINGS))
            }
            Err(e) => Err(e),
        }
    }
}

impl BackgroundJob for FinishedBuildsSyncJob {
    fn id(&self) -> &'static str {
        "finished_builds_sync"
    }

    fn name(&self) -> &'static str {
        "Finished Builds Sync"
    }

    fn description(&self) -> &'static str {
        "Copy finished builds into the analytics store"
    }

    fn schedule(&self) -> JobSchedule {
        JobSchedule::Interval(self.interval)
    }

    fn shutdown_behavior(&self) -> ShutdownBehavior {
        // A flush in progress must be acknowledged or abandoned as a whole.
        ShutdownBehavior::WaitForCompletion
    }

    fn execute_with_params(
        &self,
        ctx: &JobContext,
        params: Option<JsonValue>,
    ) -> Result<JobOutcome, JobError> {
        if ctx.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let params: SyncParams = match params {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| JobError::InvalidParams(e.to_string()))?,
            None => SyncParams::default(),
        };
        let shard_id = params.shard_id.unwrap_or(0);
        let shard_count = params.shard_count.unwrap_or(self.shard_count);

        let audit = JobAuditLogger::new(Arc::clone(&ctx.state_store), self.id());
        audit.log_started(Some(serde_json::json!({
            "shard_id": shard_id,
            "shard_count": shard_count,
        })));

        let result = match self.invoke(shard_id, shard_count) {
            Ok(result) => result,
            Err(e) => {
                let error_msg = e.to_string();
                audit.log_failed(
                    &error_msg,
                    Some(serde_json::json!({
                        "shard_id": shard_id,
                        "shard_count": shard_count,
                    })),
                );
                return Err(JobError::ExecutionFailed(error_msg));
            }
        };
        let details = serde_json::to_value(&result).ok();

        if let Some(summary) = &result.payload {
            audit.log_completed(details);
            if summary.reached_end {
                return Ok(JobOutcome::Idle);
            }
            info!(
                "Shard {}/{} stopped on its time budget, more events pending",
                shard_id, shard_count
            );
            return Ok(JobOutcome::MoreWork);
        }

        match result.reason.as_deref() {
            Some(REASON_SKIPPED) => {
                audit.log_skipped(details);
                Ok(JobOutcome::Idle)
            }
            Some(REASON_INVALID_SHARD) => {
                audit.log_failed(REASON_INVALID_SHARD, details);
                Err(JobError::InvalidParams(format!(
                    "shard {} of {} does not exist",
                    shard_id, shard_count
                )))
            }
            reason => {
                let reason = reason.unwrap_or("unknown");
                audit.log_failed(reason, details);
                Err(JobError::ExecutionFailed(reason.to_string()))
            }
        }
    }
}
