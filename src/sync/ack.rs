use super::batch_writer::FlushedBatch;
use crate::metrics;
use crate::source_store::SyncEventLog;
use anyhow::{Context, Result};
use tracing::debug;

/// Marks events processed once their rows are durable at the destination.
pub struct AcknowledgmentCommitter<'a> {
    log: &'a dyn SyncEventLog,
}

impl<'a> AcknowledgmentCommitter<'a> {
    pub fn new(log: &'a dyn SyncEventLog) -> Self {
        Self { log }
    }

    /// Acknowledges every event of `flushed` in one transaction. Returns the
    /// number of events that flipped; events already processed by an earlier
    /// delivery are not counted.
    pub fn commit(&self, flushed: &FlushedBatch) -> Result<usize> {
        if flushed.event_keys.is_empty() {
            return Ok(0);
        }
        let changed = self
            .log
            .mark_processed(&flushed.event_keys)
            .with_context(|| {
                format!(
                    "Failed to acknowledge {} events",
                    flushed.event_keys.len()
                )
            })?;
        metrics::record_events_acknowledged(changed);
        debug!(
            "Acknowledged {} of {} events",
            changed,
            flushed.event_keys.len()
        );
        Ok(changed)
    }
}
