//! Keyset pagination over the change event log.

use crate::source_store::{EventKey, ShardSpec, SyncEvent, SyncEventLog};
use anyhow::{bail, Result};

/// Walks the unprocessed events of one shard in `(ready_at, source_id)`
/// order. Lives for a single run and is never persisted: the event log's
/// `processed` flags are the durable progress marker.
pub struct EventCursor<'a> {
    log: &'a dyn SyncEventLog,
    shard: ShardSpec,
    page_size: usize,
    last_seen: Option<EventKey>,
    exhausted: bool,
}

impl<'a> EventCursor<'a> {
    pub fn new(log: &'a dyn SyncEventLog, shard: ShardSpec, page_size: usize) -> Self {
        Self {
            log,
            shard,
            page_size: page_size.max(1),
            last_seen: None,
            exhausted: false,
        }
    }

    pub fn last_seen(&self) -> Option<EventKey> {
        self.last_seen
    }

    /// True once an empty or short page has been returned.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// The next page, or `None` when the log holds nothing past the cursor.
    pub fn next_page(&mut self) -> Result<Option<Vec<SyncEvent>>> {
        if self.exhausted {
            return Ok(None);
        }

        let page = self
            .log
            .fetch_unprocessed_after(self.shard, self.last_seen, self.page_size)?;
        let (Some(first), Some(last)) = (page.first(), page.last()) else {
            self.exhausted = true;
            return Ok(None);
        };

        if let Some(previous) = self.last_seen {
            if first.key() <= previous {
                bail!(
                    "Event log returned key {:?} not after cursor position {:?}",
                    first.key(),
                    previous
                );
            }
        }

        if page.len() < self.page_size {
            self.exhausted = true;
        }
        self.last_seen = Some(last.key());
        Ok(Some(page))
    }
}
