//! Demo data for a fresh source database.

use super::{BuildStatus, NewBuild, RunnerManagerRecord, SqliteSourceStore};
use anyhow::{bail, Result};
use chrono::{Duration, Utc};
use tracing::info;

pub const DEMO_PROJECT_ID: i64 = 10;
const BUILDS_PER_PIPELINE: i64 = 5;
const JOB_NAMES: [&str; 3] = ["rspec", "lint", "build-image"];

/// Seeds namespaces, a project, one runner, and `build_count` finished builds,
/// each with its sync event. Every fourth build gets a retried predecessor.
pub fn seed_demo(store: &SqliteSourceStore, build_count: usize) -> Result<usize> {
    if build_count == 0 {
        bail!("build_count must be at least 1");
    }

    store.insert_namespace(1, "acme", None)?;
    store.insert_namespace(2, "platform", Some(1))?;
    store.insert_project(DEMO_PROJECT_ID, "ci-engine", 2)?;
    store.insert_runner(1, "instance_type", Some("shared docker runner"), &["docker", "linux"])?;
    store.insert_runner_manager(&RunnerManagerRecord {
        id: 100,
        runner_id: 1,
        system_xid: "s_demo0001".to_string(),
        version: Some("17.5.0".to_string()),
        platform: Some("linux".to_string()),
        architecture: Some("amd64".to_string()),
    })?;

    let base = Utc::now() - Duration::hours(1);
    // Retried predecessors take ids after the finished builds.
    let mut next_retried_id = build_count as i64 + 1;
    let mut finished = 0;
    for i in 1..=build_count as i64 {
        let pipeline_id = (i - 1) / BUILDS_PER_PIPELINE + 1;
        let name = JOB_NAMES[(i as usize) % JOB_NAMES.len()];
        let created_at = base + Duration::seconds(i * 10);
        let build = NewBuild {
            id: i,
            project_id: DEMO_PROJECT_ID,
            pipeline_id,
            name: name.to_string(),
            stage: Some("test".to_string()),
            status: BuildStatus::Running,
            ref_name: Some("main".to_string()),
            created_at,
            queued_at: Some(created_at + Duration::seconds(1)),
            started_at: Some(created_at + Duration::seconds(3)),
            runner_id: Some(1),
            runner_manager_id: Some(100),
            retried: false,
        };

        if i % 4 == 0 {
            store.insert_build(&NewBuild {
                id: next_retried_id,
                status: BuildStatus::Failed,
                retried: true,
                ..build.clone()
            })?;
            next_retried_id += 1;
        }

        store.insert_build(&build)?;
        store.insert_artifact(i, "trace", 2048 + i)?;
        if i % 2 == 0 {
            store.insert_artifact(i, "junit", 512)?;
        }

        let status = if i % 5 == 0 {
            BuildStatus::Failed
        } else {
            BuildStatus::Success
        };
        if store.finish_build(i, status, created_at + Duration::seconds(30))? {
            finished += 1;
        }
    }

    info!(
        "Seeded demo project {} with {} finished builds",
        DEMO_PROJECT_ID, finished
    );
    Ok(finished)
}
