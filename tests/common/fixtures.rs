//! Databases in a temporary directory, seeded with one project and runner.

use super::constants::*;
use chrono::{DateTime, TimeZone, Utc};
use finished_builds_sync::analytics::{AnalyticsDestination, EnrichedRow};
use finished_builds_sync::source_store::{
    BuildRecords, BuildStatus, NewBuild, RunnerManagerRecord, ShardSpec, SqliteSourceStore,
    SyncEventLog,
};
use finished_builds_sync::state_store::SqliteStateStore;
use finished_builds_sync::sync::{Clock, SyncOrchestrator, SyncSettings, SystemClock};
use finished_builds_sync::SqliteAnalyticsStore;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub fn at(offset_secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(BASE_TIMESTAMP + offset_secs, 0).unwrap()
}

/// Settings with the given page size and pages per write.
pub fn settings(batch_size: usize, batch_count: usize) -> SyncSettings {
    SyncSettings {
        batch_size,
        batch_count,
        ..Default::default()
    }
}

/// Settings whose runtime budget is measured against a [`SteppingClock`].
pub fn time_boxed_settings(batch_size: usize, max_runtime: Duration) -> SyncSettings {
    SyncSettings {
        batch_size,
        batch_count: 1,
        max_runtime,
        lease_ttl: max_runtime + Duration::from_secs(60),
    }
}

pub struct TestEnv {
    pub source: Arc<SqliteSourceStore>,
    pub state: Arc<SqliteStateStore>,
    pub analytics: Arc<SqliteAnalyticsStore>,
    pub temp_dir: TempDir,
}

/// Inserts a build with one artifact and finishes it, which appends its
/// sync event with `ready_at = finished_at`.
pub fn insert_finished_build(
    source: &SqliteSourceStore,
    id: i64,
    pipeline_id: i64,
    name: &str,
    finished_at: DateTime<Utc>,
) {
    source
        .insert_build(&TestEnv::new_build(id, pipeline_id, name))
        .unwrap();
    source.insert_artifact(id, "trace", 1024).unwrap();
    assert!(source
        .finish_build(id, BuildStatus::Success, finished_at)
        .unwrap());
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let source = Arc::new(SqliteSourceStore::new(temp_dir.path().join("source.db")).unwrap());
        let state = Arc::new(SqliteStateStore::new(temp_dir.path().join("state.db")).unwrap());
        let analytics =
            Arc::new(SqliteAnalyticsStore::new(temp_dir.path().join("analytics.db")).unwrap());

        source
            .insert_namespace(ROOT_NAMESPACE_ID, "acme", None)
            .unwrap();
        source
            .insert_namespace(SUB_NAMESPACE_ID, "platform", Some(ROOT_NAMESPACE_ID))
            .unwrap();
        source
            .insert_project(PROJECT_ID, "ci-engine", SUB_NAMESPACE_ID)
            .unwrap();
        source
            .insert_runner(RUNNER_ID, "instance_type", Some("shared"), &RUNNER_TAGS)
            .unwrap();
        source
            .insert_runner_manager(&RunnerManagerRecord {
                id: RUNNER_MANAGER_ID,
                runner_id: RUNNER_ID,
                system_xid: "s_test0001".to_string(),
                version: Some("17.5.0".to_string()),
                platform: Some("linux".to_string()),
                architecture: Some("amd64".to_string()),
            })
            .unwrap();

        Self {
            source,
            state,
            analytics,
            temp_dir,
        }
    }

    /// Orchestrator writing into the local analytics store.
    pub fn orchestrator(&self, settings: SyncSettings) -> SyncOrchestrator {
        self.orchestrator_with(self.analytics.clone(), Arc::new(SystemClock), settings)
    }

    pub fn orchestrator_with(
        &self,
        destination: Arc<dyn AnalyticsDestination>,
        clock: Arc<dyn Clock>,
        settings: SyncSettings,
    ) -> SyncOrchestrator {
        self.orchestrator_with_records(self.source.clone(), destination, clock, settings)
    }

    pub fn orchestrator_with_records(
        &self,
        records: Arc<dyn BuildRecords>,
        destination: Arc<dyn AnalyticsDestination>,
        clock: Arc<dyn Clock>,
        settings: SyncSettings,
    ) -> SyncOrchestrator {
        SyncOrchestrator::new(
            self.source.clone(),
            records,
            destination,
            self.state.clone(),
            clock,
            settings,
        )
    }

    fn new_build(id: i64, pipeline_id: i64, name: &str) -> NewBuild {
        NewBuild {
            id,
            project_id: PROJECT_ID,
            pipeline_id,
            name: name.to_string(),
            stage: Some("test".to_string()),
            status: BuildStatus::Running,
            ref_name: Some("main".to_string()),
            created_at: at(id - 60),
            queued_at: Some(at(id - 50)),
            started_at: Some(at(id - 40)),
            runner_id: Some(RUNNER_ID),
            runner_manager_id: Some(RUNNER_MANAGER_ID),
            retried: false,
        }
    }

    /// Inserts build `id` in its own pipeline and finishes it at `at(id)`.
    pub fn add_finished_build(&self, id: i64) {
        self.add_finished_build_in(id, id, "rspec");
    }

    pub fn add_finished_build_in(&self, id: i64, pipeline_id: i64, name: &str) {
        insert_finished_build(&self.source, id, pipeline_id, name, at(id));
    }

    pub fn add_finished_builds(&self, ids: impl IntoIterator<Item = i64>) {
        for id in ids {
            self.add_finished_build(id);
        }
    }

    /// Adds `count` retried attempts of the same job ahead of a build.
    pub fn add_retried_attempts(&self, pipeline_id: i64, name: &str, count: i64) {
        for n in 0..count {
            let id = RETRIED_BUILD_ID_BASE + pipeline_id * 100 + n;
            let mut build = Self::new_build(id, pipeline_id, name);
            build.status = BuildStatus::Failed;
            build.retried = true;
            self.source.insert_build(&build).unwrap();
        }
    }

    pub fn unprocessed(&self) -> usize {
        self.source.count_unprocessed(None).unwrap()
    }

    pub fn unprocessed_in(&self, shard: ShardSpec) -> usize {
        self.source.count_unprocessed(Some(shard)).unwrap()
    }

    pub fn rows(&self) -> Vec<EnrichedRow> {
        self.analytics.all_rows().unwrap()
    }

    pub fn row_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.rows().iter().map(|r| r.id).collect();
        ids.sort();
        ids
    }
}
