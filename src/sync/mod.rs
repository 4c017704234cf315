pub mod ack;
pub mod batch_writer;
pub mod cursor;
pub mod enrichment;
pub mod lease;
pub mod orchestrator;
pub mod runtime_limiter;

pub use lease::{lease_key, AcquirePolicy, LeaseCoordinator, LeaseGuard, DEFAULT_LEASE_TTL};
pub use orchestrator::{
    RunState, RunSummary, SyncError, SyncOrchestrator, SyncRun, SyncSettings, DEFAULT_BATCH_COUNT,
    DEFAULT_BATCH_SIZE, DEFAULT_MAX_RUNTIME, MAX_BATCH_SIZE,
};
pub use runtime_limiter::{Clock, RuntimeLimiter, SystemClock};
