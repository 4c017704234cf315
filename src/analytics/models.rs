use crate::source_store::BuildStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Flattened snapshot of a finished build, as stored in the analytics table.
///
/// Rows are merged by `id`; the row with the highest `version` wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRow {
    pub id: i64,
    pub project_id: i64,
    pub pipeline_id: i64,
    pub name: String,
    pub stage: Option<String>,
    pub status: BuildStatus,
    pub ref_name: Option<String>,
    #[serde(with = "clickhouse_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "clickhouse_datetime_opt")]
    pub queued_at: Option<DateTime<Utc>>,
    #[serde(with = "clickhouse_datetime_opt")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(with = "clickhouse_datetime_opt")]
    pub finished_at: Option<DateTime<Utc>>,
    /// finished_at - started_at
    pub duration_ms: Option<i64>,
    /// started_at - queued_at
    pub queueing_duration_ms: Option<i64>,

    pub root_namespace_id: Option<i64>,
    /// Traversal ids joined with '/', with a trailing '/': "1/5/9/".
    pub namespace_path: String,

    pub runner_id: Option<i64>,
    pub runner_type: Option<String>,
    pub runner_description: Option<String>,
    pub runner_tags: Vec<String>,
    pub runner_manager_system_xid: Option<String>,
    pub runner_manager_version: Option<String>,
    pub runner_manager_platform: Option<String>,
    pub runner_manager_architecture: Option<String>,

    pub retries_count: u32,

    pub artifacts_count: u32,
    pub artifacts_size_bytes: i64,
    pub artifact_file_types: Vec<String>,

    pub version: i64,
}

/// ClickHouse `DateTime64(6, 'UTC')` text representation.
const CLICKHOUSE_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

mod clickhouse_datetime {
    use super::CLICKHOUSE_DATETIME_FORMAT;
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&dt.format(CLICKHOUSE_DATETIME_FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&s, CLICKHOUSE_DATETIME_FORMAT)
            .map(|naive| naive.and_utc())
            .map_err(serde::de::Error::custom)
    }
}

mod clickhouse_datetime_opt {
    use super::CLICKHOUSE_DATETIME_FORMAT;
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        dt: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match dt {
            Some(dt) => {
                serializer.serialize_str(&dt.format(CLICKHOUSE_DATETIME_FORMAT).to_string())
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let s: Option<String> = Option::deserialize(deserializer)?;
        s.map(|s| {
            NaiveDateTime::parse_from_str(&s, CLICKHOUSE_DATETIME_FORMAT)
                .map(|naive| naive.and_utc())
                .map_err(serde::de::Error::custom)
        })
        .transpose()
    }
}
