//! Background job scheduling and execution system.
//!
//! Runs the sync job for every shard on an interval, plus periodic
//! maintenance of the job audit log.

mod audit_logger;
mod context;
mod job;
pub mod jobs;
mod scheduler;

pub use audit_logger::JobAuditLogger;
pub use context::JobContext;
pub use job::{BackgroundJob, JobError, JobOutcome, JobSchedule, ShutdownBehavior};
pub use scheduler::JobScheduler;
