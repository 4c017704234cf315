//! SQLite schema for the transactional CI database.
//!
//! Timestamps are stored as integer microseconds since the epoch so that the
//! event log ordering `(ready_at, source_id)` is exact.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};

const NAMESPACES_TABLE_V1: Table = Table {
    name: "namespaces",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("parent_id", &SqlType::Integer),
        // Root first, e.g. "1/5/9"
        sqlite_column!("traversal_ids", &SqlType::Text, non_null = true),
    ],
    indices: &[("idx_namespaces_parent_id", "parent_id")],
    unique_constraints: &[],
};

const PROJECTS_TABLE_V1: Table = Table {
    name: "projects",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("namespace_id", &SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_projects_namespace_id", "namespace_id")],
    unique_constraints: &[],
};

const RUNNERS_TABLE_V1: Table = Table {
    name: "runners",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("runner_type", &SqlType::Text, non_null = true),
        sqlite_column!("description", &SqlType::Text),
    ],
    indices: &[],
    unique_constraints: &[],
};

const RUNNER_TAGS_TABLE_V1: Table = Table {
    name: "runner_tags",
    columns: &[
        sqlite_column!("runner_id", &SqlType::Integer, non_null = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
    ],
    indices: &[("idx_runner_tags_runner_id", "runner_id")],
    unique_constraints: &[&["runner_id", "name"]],
};

const RUNNER_MANAGERS_TABLE_V1: Table = Table {
    name: "runner_managers",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("runner_id", &SqlType::Integer, non_null = true),
        sqlite_column!("system_xid", &SqlType::Text, non_null = true),
        sqlite_column!("version", &SqlType::Text),
        sqlite_column!("platform", &SqlType::Text),
        sqlite_column!("architecture", &SqlType::Text),
    ],
    indices: &[("idx_runner_managers_runner_id", "runner_id")],
    unique_constraints: &[],
};

const BUILDS_TABLE_V1: Table = Table {
    name: "builds",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("project_id", &SqlType::Integer, non_null = true),
        sqlite_column!("pipeline_id", &SqlType::Integer, non_null = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("stage", &SqlType::Text),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("ref_name", &SqlType::Text),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("queued_at", &SqlType::Integer),
        sqlite_column!("started_at", &SqlType::Integer),
        sqlite_column!("finished_at", &SqlType::Integer),
        sqlite_column!("runner_id", &SqlType::Integer),
        sqlite_column!("runner_manager_id", &SqlType::Integer),
        sqlite_column!(
            "retried",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
    ],
    indices: &[
        ("idx_builds_pipeline_id_name", "pipeline_id, name"),
        ("idx_builds_project_id", "project_id"),
    ],
    unique_constraints: &[],
};

const JOB_ARTIFACTS_TABLE_V1: Table = Table {
    name: "job_artifacts",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("build_id", &SqlType::Integer, non_null = true),
        sqlite_column!("file_type", &SqlType::Text, non_null = true),
        sqlite_column!("size", &SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_job_artifacts_build_id", "build_id")],
    unique_constraints: &[],
};

/// The change event log. Rows are appended by the upstream producer and only
/// ever flipped from `processed = 0` to `processed = 1`.
const FINISHED_BUILD_SYNC_EVENTS_TABLE_V1: Table = Table {
    name: "finished_build_sync_events",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true), // AUTOINCREMENT
        sqlite_column!("source_id", &SqlType::Integer, non_null = true),
        sqlite_column!("project_id", &SqlType::Integer, non_null = true),
        sqlite_column!("ready_at", &SqlType::Integer, non_null = true),
        sqlite_column!(
            "processed",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
    ],
    indices: &[
        (
            "idx_finished_build_sync_events_pending",
            "processed, ready_at, source_id",
        ),
        ("idx_finished_build_sync_events_source_id", "source_id"),
    ],
    unique_constraints: &[],
};

pub const SOURCE_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 1,
    tables: &[
        NAMESPACES_TABLE_V1,
        PROJECTS_TABLE_V1,
        RUNNERS_TABLE_V1,
        RUNNER_TAGS_TABLE_V1,
        RUNNER_MANAGERS_TABLE_V1,
        BUILDS_TABLE_V1,
        JOB_ARTIFACTS_TABLE_V1,
        FINISHED_BUILD_SYNC_EVENTS_TABLE_V1,
    ],
    migration: None,
}];
