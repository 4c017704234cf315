//! Specific background job implementations.

pub mod audit_log_cleanup;
pub mod finished_builds_sync;

pub use audit_log_cleanup::AuditLogCleanupJob;
pub use finished_builds_sync::{FinishedBuildsSyncJob, InvocationResult, InvocationStatus};
