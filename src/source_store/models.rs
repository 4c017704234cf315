use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Converts a timestamp into the integer microseconds stored in SQLite.
pub fn to_micros(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_micros()
}

/// Inverse of [`to_micros`]. Out of range values clamp to the epoch.
pub fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

// =============================================================================
// Sync events
// =============================================================================

/// Position of an event in the consumption order.
///
/// Field order matters: the derived `Ord` compares `ready_at_micros` first and
/// breaks ties on `source_id`, which is exactly the keyset order of the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventKey {
    pub ready_at_micros: i64,
    pub source_id: i64,
}

/// A "finished build pending copy" marker from the change event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEvent {
    /// Build id.
    pub source_id: i64,
    /// Project owning the build.
    pub owning_context_id: i64,
    /// When the build finished.
    pub ready_at: DateTime<Utc>,
    pub processed: bool,
}

impl SyncEvent {
    pub fn key(&self) -> EventKey {
        EventKey {
            ready_at_micros: to_micros(&self.ready_at),
            source_id: self.source_id,
        }
    }
}

/// Identity of one worker among `shard_count` cooperating workers.
///
/// An event belongs to the shard `source_id mod shard_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardSpec {
    pub shard_id: u32,
    pub shard_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidShard {
    pub shard_id: u32,
    pub shard_count: u32,
}

impl fmt::Display for InvalidShard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "shard_id {} is out of range for shard_count {}",
            self.shard_id, self.shard_count
        )
    }
}

impl std::error::Error for InvalidShard {}

impl ShardSpec {
    pub fn new(shard_id: u32, shard_count: u32) -> Result<Self, InvalidShard> {
        if shard_count == 0 || shard_id >= shard_count {
            return Err(InvalidShard {
                shard_id,
                shard_count,
            });
        }
        Ok(Self {
            shard_id,
            shard_count,
        })
    }

    /// The whole event log as a single shard.
    pub fn single() -> Self {
        Self {
            shard_id: 0,
            shard_count: 1,
        }
    }

    pub fn owns(&self, source_id: i64) -> bool {
        source_id.rem_euclid(self.shard_count as i64) == self.shard_id as i64
    }

    pub fn all(shard_count: u32) -> impl Iterator<Item = ShardSpec> {
        (0..shard_count).map(move |shard_id| ShardSpec {
            shard_id,
            shard_count,
        })
    }
}

impl Default for ShardSpec {
    fn default() -> Self {
        Self::single()
    }
}

impl fmt::Display for ShardSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.shard_id, self.shard_count)
    }
}

// =============================================================================
// Builds and joined attributes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Created,
    Pending,
    Running,
    Success,
    Failed,
    Canceled,
    Skipped,
    Manual,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Created => "created",
            BuildStatus::Pending => "pending",
            BuildStatus::Running => "running",
            BuildStatus::Success => "success",
            BuildStatus::Failed => "failed",
            BuildStatus::Canceled => "canceled",
            BuildStatus::Skipped => "skipped",
            BuildStatus::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(BuildStatus::Created),
            "pending" => Some(BuildStatus::Pending),
            "running" => Some(BuildStatus::Running),
            "success" => Some(BuildStatus::Success),
            "failed" => Some(BuildStatus::Failed),
            "canceled" => Some(BuildStatus::Canceled),
            "skipped" => Some(BuildStatus::Skipped),
            "manual" => Some(BuildStatus::Manual),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            BuildStatus::Success | BuildStatus::Failed | BuildStatus::Canceled
        )
    }
}

/// A build row from the transactional store.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildRecord {
    pub id: i64,
    pub project_id: i64,
    pub pipeline_id: i64,
    pub name: String,
    pub stage: Option<String>,
    pub status: BuildStatus,
    pub ref_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub runner_id: Option<i64>,
    pub runner_manager_id: Option<i64>,
    /// Set when a newer attempt of the same job replaced this one.
    pub retried: bool,
}

/// Traversal path of the namespace owning a project, root first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectNamespace {
    pub project_id: i64,
    pub traversal_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerRecord {
    pub id: i64,
    pub runner_type: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerTag {
    pub runner_id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerManagerRecord {
    pub id: i64,
    pub runner_id: i64,
    pub system_xid: String,
    pub version: Option<String>,
    pub platform: Option<String>,
    pub architecture: Option<String>,
}

/// Number of retried builds sharing a name inside a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryCount {
    pub pipeline_id: i64,
    pub name: String,
    pub retried: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSummary {
    pub build_id: i64,
    pub count: u32,
    pub size_bytes: i64,
    /// Distinct file types, sorted.
    pub file_types: Vec<String>,
}

/// Input for inserting a build. Used by the upstream side and fixtures.
#[derive(Debug, Clone)]
pub struct NewBuild {
    pub id: i64,
    pub project_id: i64,
    pub pipeline_id: i64,
    pub name: String,
    pub stage: Option<String>,
    pub status: BuildStatus,
    pub ref_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub runner_id: Option<i64>,
    pub runner_manager_id: Option<i64>,
    pub retried: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_key_orders_by_time_then_id() {
        let a = EventKey {
            ready_at_micros: 10,
            source_id: 99,
        };
        let b = EventKey {
            ready_at_micros: 11,
            source_id: 1,
        };
        let c = EventKey {
            ready_at_micros: 11,
            source_id: 2,
        };
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_shard_spec_validation() {
        assert!(ShardSpec::new(0, 1).is_ok());
        assert!(ShardSpec::new(3, 4).is_ok());
        assert!(ShardSpec::new(4, 4).is_err());
        assert!(ShardSpec::new(0, 0).is_err());
    }

    #[test]
    fn test_every_id_has_exactly_one_shard() {
        for id in -20i64..200 {
            let owners = ShardSpec::all(3).filter(|s| s.owns(id)).count();
            assert_eq!(owners, 1, "id {} owned by {} shards", id, owners);
        }
    }

    #[test]
    fn test_build_status_roundtrip_and_finished() {
        for status in [
            BuildStatus::Created,
            BuildStatus::Running,
            BuildStatus::Success,
            BuildStatus::Failed,
            BuildStatus::Canceled,
        ] {
            assert_eq!(BuildStatus::parse(status.as_str()), Some(status));
        }
        assert!(BuildStatus::Failed.is_finished());
        assert!(!BuildStatus::Running.is_finished());
        assert_eq!(BuildStatus::parse("bogus"), None);
    }

    #[test]
    fn test_micros_roundtrip() {
        let dt = from_micros(1_700_000_000_123_456);
        assert_eq!(to_micros(&dt), 1_700_000_000_123_456);
    }
}
