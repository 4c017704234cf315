use crate::analytics::encoder::encode_rows;
use crate::analytics::{AnalyticsDestination, DestinationError, EnrichedRow};
use crate::metrics;
use crate::source_store::EventKey;
use std::time::Instant;
use tracing::{debug, warn};

/// Proof that a flush reached the destination. Only a successful
/// [`BatchWriter::flush`] produces one, and only this can be acknowledged.
#[derive(Debug)]
pub struct FlushedBatch {
    pub rows_written: usize,
    pub event_keys: Vec<EventKey>,
}

/// Holds up to `batch_count` logical batches (one per page) and writes them
/// as a single physical batch.
pub struct BatchWriter<'a> {
    destination: &'a dyn AnalyticsDestination,
    batch_count: usize,
    pending_rows: Vec<EnrichedRow>,
    pending_keys: Vec<EventKey>,
    pending_batches: usize,
}

impl<'a> BatchWriter<'a> {
    pub fn new(destination: &'a dyn AnalyticsDestination, batch_count: usize) -> Self {
        Self {
            destination,
            batch_count: batch_count.max(1),
            pending_rows: Vec::new(),
            pending_keys: Vec::new(),
            pending_batches: 0,
        }
    }

    /// Adds one page worth of rows together with the events that produced
    /// them. `rows` may be shorter than `event_keys` when sources vanished.
    pub fn push_batch(&mut self, rows: Vec<EnrichedRow>, event_keys: Vec<EventKey>) {
        self.pending_rows.extend(rows);
        self.pending_keys.extend(event_keys);
        self.pending_batches += 1;
    }

    pub fn is_full(&self) -> bool {
        self.pending_batches >= self.batch_count
    }

    pub fn has_pending(&self) -> bool {
        self.pending_batches > 0
    }

    pub fn pending_rows(&self) -> usize {
        self.pending_rows.len()
    }

    /// Writes every pending row in one call to the destination.
    ///
    /// When only vanished sources are pending there is nothing to write, but
    /// their events are still handed back for acknowledgment.
    pub fn flush(&mut self, shard_id: u32) -> Result<FlushedBatch, DestinationError> {
        let rows = std::mem::take(&mut self.pending_rows);
        let event_keys = std::mem::take(&mut self.pending_keys);
        let batches = std::mem::replace(&mut self.pending_batches, 0);

        if rows.is_empty() {
            debug!(
                "Nothing to write for {} events, skipping destination",
                event_keys.len()
            );
            return Ok(FlushedBatch {
                rows_written: 0,
                event_keys,
            });
        }

        let start = Instant::now();
        let result = encode_rows(&rows)
            .map_err(DestinationError::from)
            .and_then(|encoded| self.destination.write_batch(&encoded));
        let duration = start.elapsed();
        metrics::record_flush(rows.len(), shard_id, duration, result.is_ok());

        match result {
            Ok(()) => {
                debug!(
                    "Flushed {} rows from {} batches in {:?}",
                    rows.len(),
                    batches,
                    duration
                );
                Ok(FlushedBatch {
                    rows_written: rows.len(),
                    event_keys,
                })
            }
            Err(e) => {
                warn!("Flush of {} rows failed: {}", rows.len(), e);
                Err(e)
            }
        }
    }
}
