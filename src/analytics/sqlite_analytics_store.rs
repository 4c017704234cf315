//! Embedded analytics destination, used for local runs and tests.
//!
//! Mirrors the ClickHouse merge semantics eagerly: an upsert only replaces a
//! stored row when the incoming `version` is at least as high.

use super::encoder::decode_rows;
use super::{AnalyticsDestination, DestinationError, EncodedBatch, EnrichedRow};
use crate::source_store::{from_micros, to_micros, BuildStatus};
use crate::sqlite_column;
use crate::sqlite_persistence::{open_versioned, Column, SqlType, Table, VersionedSchema};
use anyhow::Result;
use rusqlite::{params, types::Type, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

const FINISHED_BUILDS_TABLE_V1: Table = Table {
    name: "ci_finished_builds",
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
        sqlite_column!("duration_ms", &SqlType::Integer),
        sqlite_column!("queueing_duration_ms", &SqlType::Integer),
        sqlite_column!("root_namespace_id", &SqlType::Integer),
        sqlite_column!("namespace_path", &SqlType::Text, non_null = true),
        sqlite_column!("runner_id", &SqlType::Integer),
        sqlite_column!("runner_type", &SqlType::Text),
        sqlite_column!("runner_description", &SqlType::Text),
        sqlite_column!("runner_tags", &SqlType::Text, non_null = true), // JSON array
        sqlite_column!("runner_manager_system_xid", &SqlType::Text),
        sqlite_column!("runner_manager_version", &SqlType::Text),
        sqlite_column!("runner_manager_platform", &SqlType::Text),
        sqlite_column!("runner_manager_architecture", &SqlType::Text),
        sqlite_column!("retries_count", &SqlType::Integer, non_null = true),
        sqlite_column!("artifacts_count", &SqlType::Integer, non_null = true),
        sqlite_column!("artifacts_size_bytes", &SqlType::Integer, non_null = true),
        sqlite_column!("artifact_file_types", &SqlType::Text, non_null = true), // JSON array
        sqlite_column!("version", &SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_ci_finished_builds_project_id", "project_id")],
    unique_constraints: &[],
};

pub const ANALYTICS_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 1,
    tables: &[FINISHED_BUILDS_TABLE_V1],
    migration: None,
}];

const ROW_COLUMNS: &str = "id, project_id, pipeline_id, name, stage, status, ref_name, \
     created_at, queued_at, started_at, finished_at, duration_ms, queueing_duration_ms, \
     root_namespace_id, namespace_path, runner_id, runner_type, runner_description, runner_tags, \
     runner_manager_system_xid, runner_manager_version, runner_manager_platform, \
     runner_manager_architecture, retries_count, artifacts_count, artifacts_size_bytes, \
     artifact_file_types, version";

const UPSERT_SQL: &str = "INSERT INTO ci_finished_builds (
        id, project_id, pipeline_id, name, stage, status, ref_name,
        created_at, queued_at, started_at, finished_at, duration_ms, queueing_duration_ms,
        root_namespace_id, namespace_path, runner_id, runner_type, runner_description, runner_tags,
        runner_manager_system_xid, runner_manager_version, runner_manager_platform,
        runner_manager_architecture, retries_count, artifacts_count, artifacts_size_bytes,
        artifact_file_types, version)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18,
             ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28)
     ON CONFLICT(id) DO UPDATE SET
        project_id = excluded.project_id,
        pipeline_id = excluded.pipeline_id,
        name = excluded.name,
        stage = excluded.stage,
        status = excluded.status,
        ref_name = excluded.ref_name,
        created_at = excluded.created_at,
        queued_at = excluded.queued_at,
        started_at = excluded.started_at,
        finished_at = excluded.finished_at,
        duration_ms = excluded.duration_ms,
        queueing_duration_ms = excluded.queueing_duration_ms,
        root_namespace_id = excluded.root_namespace_id,
        namespace_path = excluded.namespace_path,
        runner_id = excluded.runner_id,
        runner_type = excluded.runner_type,
        runner_description = excluded.runner_description,
        runner_tags = excluded.runner_tags,
        runner_manager_system_xid = excluded.runner_manager_system_xid,
        runner_manager_version = excluded.runner_manager_version,
        runner_manager_platform = excluded.runner_manager_platform,
        runner_manager_architecture = excluded.runner_manager_architecture,
        retries_count = excluded.retries_count,
        artifacts_count = excluded.artifacts_count,
        artifacts_size_bytes = excluded.artifacts_size_bytes,
        artifact_file_types = excluded.artifact_file_types,
        version = excluded.version
     WHERE excluded.version >= ci_finished_builds.version";

pub struct SqliteAnalyticsStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteAnalyticsStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned(db_path, ANALYTICS_VERSIONED_SCHEMAS, "analytics")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn upsert_rows(&self, rows: &[EnrichedRow]) -> rusqlite::Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut applied = 0;
        {
            let mut stmt = tx.prepare_cached(UPSERT_SQL)?;
            for row in rows {
                let runner_tags = serde_json::to_string(&row.runner_tags)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                let file_types = serde_json::to_string(&row.artifact_file_types)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                applied += stmt.execute(params![
                    row.id,
                    row.project_id,
                    row.pipeline_id,
                    row.name,
                    row.stage,
                    row.status.as_str(),
                    row.ref_name,
                    to_micros(&row.created_at),
                    row.queued_at.as_ref().map(to_micros),
                    row.started_at.as_ref().map(to_micros),
                    row.finished_at.as_ref().map(to_micros),
                    row.duration_ms,
                    row.queueing_duration_ms,
                    row.root_namespace_id,
                    row.namespace_path,
                    row.runner_id,
                    row.runner_type,
                    row.runner_description,
                    runner_tags,
                    row.runner_manager_system_xid,
                    row.runner_manager_version,
                    row.runner_manager_platform,
                    row.runner_manager_architecture,
                    row.retries_count,
                    row.artifacts_count,
                    row.artifacts_size_bytes,
                    file_types,
                    row.version,
                ])?;
            }
        }
        tx.commit()?;
        Ok(applied)
    }

    fn row_to_enriched(row: &rusqlite::Row) -> rusqlite::Result<EnrichedRow> {
        let json_list = |idx: usize| -> rusqlite::Result<Vec<String>> {
            let raw: String = row.get(idx)?;
            serde_json::from_str(&raw)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
        };
        let status_str: String = row.get(5)?;
        let status = BuildStatus::parse(&status_str).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                Type::Text,
                format!("unknown build status '{}'", status_str).into(),
            )
        })?;

        Ok(EnrichedRow {
            id: row.get(0)?,
            project_id: row.get(1)?,
            pipeline_id: row.get(2)?,
            name: row.get(3)?,
            stage: row.get(4)?,
            status,
            ref_name: row.get(6)?,
            created_at: from_micros(row.get(7)?),
            queued_at: row.get::<_, Option<i64>>(8)?.map(from_micros),
            started_at: row.get::<_, Option<i64>>(9)?.map(from_micros),
            finished_at: row.get::<_, Option<i64>>(10)?.map(from_micros),
            duration_ms: row.get(11)?,
            queueing_duration_ms: row.get(12)?,
            root_namespace_id: row.get(13)?,
            namespace_path: row.get(14)?,
            runner_id: row.get(15)?,
            runner_type: row.get(16)?,
            runner_description: row.get(17)?,
            runner_tags: json_list(18)?,
            runner_manager_system_xid: row.get(19)?,
            runner_manager_version: row.get(20)?,
            runner_manager_platform: row.get(21)?,
            runner_manager_architecture: row.get(22)?,
            retries_count: row.get(23)?,
            artifacts_count: row.get(24)?,
            artifacts_size_bytes: row.get(25)?,
            artifact_file_types: json_list(26)?,
            version: row.get(27)?,
        })
    }

    pub fn get_row(&self, id: i64) -> Result<Option<EnrichedRow>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                &format!("SELECT {} FROM ci_finished_builds WHERE id = ?1", ROW_COLUMNS),
                params![id],
                Self::row_to_enriched,
            )
            .optional()?;
        Ok(row)
    }

    pub fn all_rows(&self) -> Result<Vec<EnrichedRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM ci_finished_builds ORDER BY id",
            ROW_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], Self::row_to_enriched)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn row_count(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM ci_finished_builds", [], |row| {
                row.get(0)
            })?;
        Ok(count as usize)
    }
}

impl AnalyticsDestination for SqliteAnalyticsStore {
    fn write_batch(&self, batch: &EncodedBatch) -> Result<(), DestinationError> {
        let rows = decode_rows(&batch.payload)?;
        let applied = self.upsert_rows(&rows)?;
        debug!(
            "Merged {} rows into analytics store ({} replaced or inserted)",
            rows.len(),
            applied
        );
        Ok(())
    }
}
