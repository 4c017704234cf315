//! One sync run: lease, paginate, enrich, write, acknowledge.

use super::ack::AcknowledgmentCommitter;
use super::batch_writer::BatchWriter;
use super::cursor::EventCursor;
use super::enrichment::EnrichmentPipeline;
use super::lease::{LeaseCoordinator, DEFAULT_LEASE_TTL};
use super::runtime_limiter::{Clock, RuntimeLimiter};
use crate::analytics::{AnalyticsDestination, DestinationError};
use crate::metrics;
use crate::source_store::{BuildRecords, InvalidShard, ShardSpec, SyncEventLog};
use crate::state_store::LockService;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const DEFAULT_BATCH_COUNT: usize = 10;
pub const DEFAULT_MAX_RUNTIME: Duration = Duration::from_secs(240);
/// Upper bound for `batch_size`. A page's ids are bound one parameter each
/// in the bulk lookups and must stay under SQLite's variable limit.
pub const MAX_BATCH_SIZE: usize = 10_000;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid shard: {0}")]
    InvalidShard(#[from] InvalidShard),

    #[error("Lease for shard {0} is held by another worker")]
    LeaseDenied(ShardSpec),

    #[error("Write failed: {0}")]
    Write(#[from] DestinationError),

    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Events per page; each page is one logical batch.
    pub batch_size: usize,
    /// Logical batches held before a physical write.
    pub batch_count: usize,
    pub max_runtime: Duration,
    pub lease_ttl: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_count: DEFAULT_BATCH_COUNT,
            max_runtime: DEFAULT_MAX_RUNTIME,
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }
}

impl SyncSettings {
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.batch_size == 0 {
            return Err(SyncError::Configuration(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.batch_size > MAX_BATCH_SIZE {
            return Err(SyncError::Configuration(format!(
                "batch_size must be at most {}",
                MAX_BATCH_SIZE
            )));
        }
        if self.batch_count == 0 {
            return Err(SyncError::Configuration(
                "batch_count must be at least 1".to_string(),
            ));
        }
        if self.max_runtime.is_zero() {
            return Err(SyncError::Configuration(
                "max_runtime must be greater than zero".to_string(),
            ));
        }
        if self.lease_ttl <= self.max_runtime {
            return Err(SyncError::Configuration(format!(
                "lease_ttl ({:?}) must exceed max_runtime ({:?})",
                self.lease_ttl, self.max_runtime
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    NotStarted,
    LeaseAcquired,
    Iterating,
    Flushing,
    Completed,
    TimeBoxed,
    LeaseDenied,
    WriteFailed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::NotStarted => "not_started",
            RunState::LeaseAcquired => "lease_acquired",
            RunState::Iterating => "iterating",
            RunState::Flushing => "flushing",
            RunState::Completed => "completed",
            RunState::TimeBoxed => "time_boxed",
            RunState::LeaseDenied => "lease_denied",
            RunState::WriteFailed => "write_failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::TimeBoxed | RunState::LeaseDenied | RunState::WriteFailed
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a run that got to process its shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// False when the run stopped on its time budget with work left.
    pub reached_end: bool,
    pub records_inserted: u64,
    pub shard_id: u32,
    pub shard_count: u32,
}

/// Progress of a single run.
#[derive(Debug)]
pub struct SyncRun {
    pub shard: ShardSpec,
    pub state: RunState,
    pub pages_read: usize,
    pub flushes: usize,
    pub records_inserted: u64,
    pub events_acknowledged: usize,
    pub missing_sources: usize,
}

impl SyncRun {
    pub fn new(shard: ShardSpec) -> Self {
        Self {
            shard,
            state: RunState::NotStarted,
            pages_read: 0,
            flushes: 0,
            records_inserted: 0,
            events_acknowledged: 0,
            missing_sources: 0,
        }
    }

    fn transition(&mut self, next: RunState) {
        if self.state != next {
            debug!("Shard {}: {} -> {}", self.shard, self.state, next);
            self.state = next;
        }
    }

    fn summary(&self) -> RunSummary {
        RunSummary {
            reached_end: self.state == RunState::Completed,
            records_inserted: self.records_inserted,
            shard_id: self.shard.shard_id,
            shard_count: self.shard.shard_count,
        }
    }
}

pub struct SyncOrchestrator {
    event_log: Arc<dyn SyncEventLog>,
    enrichment: EnrichmentPipeline,
    destination: Arc<dyn AnalyticsDestination>,
    leases: LeaseCoordinator,
    clock: Arc<dyn Clock>,
    settings: SyncSettings,
}

impl SyncOrchestrator {
    pub fn new(
        event_log: Arc<dyn SyncEventLog>,
        records: Arc<dyn BuildRecords>,
        destination: Arc<dyn AnalyticsDestination>,
        lock_service: Arc<dyn LockService>,
        clock: Arc<dyn Clock>,
        settings: SyncSettings,
    ) -> Self {
        let leases = LeaseCoordinator::new(lock_service, settings.lease_ttl);
        Self {
            event_log,
            enrichment: EnrichmentPipeline::new(records),
            destination,
            leases,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Runs one sync pass over `shard`.
    ///
    /// Returns `SyncError::LeaseDenied` without touching anything when another
    /// worker holds the shard. On `SyncError::Write` the events of the failed
    /// flush stay unprocessed.
    pub fn run(&self, shard: ShardSpec) -> Result<RunSummary, SyncError> {
        self.settings.validate()?;
        let mut run = SyncRun::new(shard);

        let Some(lease) = self.leases.try_acquire(&shard)? else {
            run.transition(RunState::LeaseDenied);
            metrics::record_lease_contention();
            metrics::record_run(run.state.as_str());
            info!("Shard {} is being synced by another worker, skipping", shard);
            return Err(SyncError::LeaseDenied(shard));
        };
        run.transition(RunState::LeaseAcquired);

        let result = self.run_with_lease(&mut run);
        if let Err(e) = lease.release() {
            warn!("Failed to release lease for shard {}: {}", shard, e);
        }

        match &result {
            Ok(summary) => {
                metrics::record_run(run.state.as_str());
                info!(
                    "Shard {} sync {}: {} rows inserted, {} events acknowledged, {} missing sources, {} pages, {} flushes",
                    shard,
                    run.state,
                    summary.records_inserted,
                    run.events_acknowledged,
                    run.missing_sources,
                    run.pages_read,
                    run.flushes
                );
            }
            Err(e) => {
                let outcome = if run.state == RunState::WriteFailed {
                    run.state.as_str()
                } else {
                    "error"
                };
                metrics::record_run(outcome);
                error!("Shard {} sync failed in state {}: {}", shard, run.state, e);
            }
        }
        result
    }

    fn run_with_lease(&self, run: &mut SyncRun) -> Result<RunSummary, SyncError> {
        let limiter = RuntimeLimiter::start(self.clock.clone(), self.settings.max_runtime);
        let mut cursor = EventCursor::new(
            self.event_log.as_ref(),
            run.shard,
            self.settings.batch_size,
        );
        let mut writer = BatchWriter::new(self.destination.as_ref(), self.settings.batch_count);
        let committer = AcknowledgmentCommitter::new(self.event_log.as_ref());

        let mut reached_end = false;
        loop {
            if limiter.over_time() {
                info!(
                    "Shard {} used its {:?} budget after {} pages, stopping",
                    run.shard, self.settings.max_runtime, run.pages_read
                );
                break;
            }

            run.transition(RunState::Iterating);
            let Some(page) = cursor.next_page()? else {
                reached_end = true;
                break;
            };
            run.pages_read += 1;

            let enriched = self.enrichment.enrich(&page, Utc::now())?;
            run.missing_sources += enriched.missing_source_ids.len();
            writer.push_batch(enriched.rows, page.iter().map(|e| e.key()).collect());

            if writer.is_full() {
                self.flush(run, &mut writer, &committer)?;
            }
            if cursor.is_exhausted() {
                reached_end = true;
                break;
            }
        }

        if writer.has_pending() {
            self.flush(run, &mut writer, &committer)?;
        }

        run.transition(if reached_end {
            RunState::Completed
        } else {
            RunState::TimeBoxed
        });
        Ok(run.summary())
    }

    fn flush(
        &self,
        run: &mut SyncRun,
        writer: &mut BatchWriter,
        committer: &AcknowledgmentCommitter,
    ) -> Result<(), SyncError> {
        run.transition(RunState::Flushing);
        let flushed = match writer.flush(run.shard.shard_id) {
            Ok(flushed) => flushed,
            Err(e) => {
                run.transition(RunState::WriteFailed);
                return Err(SyncError::Write(e));
            }
        };

        run.events_acknowledged += committer.commit(&flushed)?;
        run.records_inserted += flushed.rows_written as u64;
        run.flushes += 1;
        Ok(())
    }
}
