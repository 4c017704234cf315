//! `JSONEachRow` encoding: one JSON object per line.

use super::EnrichedRow;

/// One physical write: every pending row encoded into a single payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBatch {
    pub payload: String,
    pub row_count: usize,
}

impl EncodedBatch {
    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }
}

pub fn encode_rows(rows: &[EnrichedRow]) -> Result<EncodedBatch, serde_json::Error> {
    let mut payload = String::new();
    for row in rows {
        payload.push_str(&serde_json::to_string(row)?);
        payload.push('\n');
    }
    Ok(EncodedBatch {
        payload,
        row_count: rows.len(),
    })
}

pub fn decode_rows(payload: &str) -> Result<Vec<EnrichedRow>, serde_json::Error> {
    payload
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(serde_json::from_str)
        .collect()
}
