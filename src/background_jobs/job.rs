use super::context::JobContext;
use serde_json::Value as JsonValue;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum JobSchedule {
    /// Every `Duration`, starting when the worker starts.
    Interval(Duration),
    /// Only through `JobScheduler::trigger_job`.
    Manual,
}

impl JobSchedule {
    pub fn interval(&self) -> Option<Duration> {
        match self {
            JobSchedule::Interval(interval) => Some(*interval),
            JobSchedule::Manual => None,
        }
    }
}

/// What the worker does with an execution still in flight at shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownBehavior {
    /// Its cancellation token is triggered.
    #[default]
    Cancellable,
    /// It is left alone and awaited.
    WaitForCompletion,
}

/// What a successful execution asks of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Nothing left to do until the next interval.
    Idle,
    /// Stopped with work left; run again right away.
    MoreWork,
}

#[derive(Debug)]
pub enum JobError {
    InvalidParams(String),
    ExecutionFailed(String),
    Cancelled,
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobError::InvalidParams(msg) => write!(f, "Invalid job parameters: {}", msg),
            JobError::ExecutionFailed(msg) => write!(f, "Job execution failed: {}", msg),
            JobError::Cancelled => f.write_str("Job cancelled before it started"),
        }
    }
}

impl std::error::Error for JobError {}

/// Unit of work driven by the [`JobScheduler`](super::JobScheduler).
///
/// Executions are synchronous and run on the blocking thread pool, so
/// implementations may block on database or HTTP calls.
pub trait BackgroundJob: Send + Sync {
    /// Stable id, used in the job audit log.
    fn id(&self) -> &'static str;

    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn schedule(&self) -> JobSchedule;

    fn shutdown_behavior(&self) -> ShutdownBehavior {
        ShutdownBehavior::Cancellable
    }

    fn execute(&self, ctx: &JobContext) -> Result<JobOutcome, JobError> {
        self.execute_with_params(ctx, None)
    }

    /// `params` are the JSON parameters the entry was registered with.
    fn execute_with_params(
        &self,
        ctx: &JobContext,
        params: Option<JsonValue>,
    ) -> Result<JobOutcome, JobError>;
}
