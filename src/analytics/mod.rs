//! The columnar analytics side: row model, payload encoding and the
//! destinations that accept bulk writes.

mod clickhouse;
pub mod encoder;
mod models;
mod sqlite_analytics_store;

pub use clickhouse::{ClickHouseDestination, CLICKHOUSE_TABLE_DDL};
pub use encoder::EncodedBatch;
pub use models::EnrichedRow;
pub use sqlite_analytics_store::SqliteAnalyticsStore;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Analytics store rejected batch ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Destination unavailable: {0}")]
    Unavailable(String),
}

/// A store that merges rows by `id`, keeping the highest `version`.
///
/// `write_batch` is all-or-nothing: either every row of the batch is durable
/// or an error is returned.
pub trait AnalyticsDestination: Send + Sync {
    fn write_batch(&self, batch: &EncodedBatch) -> Result<(), DestinationError>;
}
