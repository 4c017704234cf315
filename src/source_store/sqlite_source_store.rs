use super::models::{
    from_micros, to_micros, ArtifactSummary, BuildRecord, BuildStatus, EventKey, NewBuild,
    ProjectNamespace, RetryCount, RunnerManagerRecord, RunnerRecord, RunnerTag, ShardSpec,
    SyncEvent,
};
use super::schema::SOURCE_VERSIONED_SCHEMAS;
use super::{BuildRecords, SyncEventLog};
use crate::sqlite_persistence::open_versioned;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, types::Type, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

const BUILD_COLUMNS: &str = "id, project_id, pipeline_id, name, stage, status, ref_name, \
     created_at, queued_at, started_at, finished_at, runner_id, runner_manager_id, retried";

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

pub struct SqliteSourceStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSourceStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned(db_path, SOURCE_VERSIONED_SCHEMAS, "source")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn row_to_build(row: &rusqlite::Row) -> rusqlite::Result<BuildRecord> {
        let status_str: String = row.get("status")?;
        let status = BuildStatus::parse(&status_str).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                Type::Text,
                format!("unknown build status '{}'", status_str).into(),
            )
        })?;
        let opt_time =
            |name: &str| -> rusqlite::Result<Option<DateTime<Utc>>> {
                Ok(row.get::<_, Option<i64>>(name)?.map(from_micros))
            };

        Ok(BuildRecord {
            id: row.get("id")?,
            project_id: row.get("project_id")?,
            pipeline_id: row.get("pipeline_id")?,
            name: row.get("name")?,
            stage: row.get("stage")?,
            status,
            ref_name: row.get("ref_name")?,
            created_at: from_micros(row.get("created_at")?),
            queued_at: opt_time("queued_at")?,
            started_at: opt_time("started_at")?,
            finished_at: opt_time("finished_at")?,
            runner_id: row.get("runner_id")?,
            runner_manager_id: row.get("runner_manager_id")?,
            retried: row.get::<_, i64>("retried")? != 0,
        })
    }

    fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<SyncEvent> {
        Ok(SyncEvent {
            source_id: row.get("source_id")?,
            owning_context_id: row.get("project_id")?,
            ready_at: from_micros(row.get("ready_at")?),
            processed: row.get::<_, i64>("processed")? != 0,
        })
    }

    fn parse_traversal_ids(raw: &str) -> Vec<i64> {
        raw.split('/')
            .filter_map(|part| part.trim().parse::<i64>().ok())
            .collect()
    }

    // =========================================================================
    // Writes performed by the upstream producer (and by fixtures/demo seeding)
    // =========================================================================

    /// Inserts a namespace below `parent_id`, deriving its traversal path.
    pub fn insert_namespace(&self, id: i64, name: &str, parent_id: Option<i64>) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let traversal_ids = match parent_id {
            Some(parent) => {
                let parent_path: Option<String> = tx
                    .query_row(
                        "SELECT traversal_ids FROM namespaces WHERE id = ?1",
                        params![parent],
                        |row| row.get(0),
                    )
                    .optional()?;
                match parent_path {
                    Some(path) => format!("{}/{}", path, id),
                    None => bail!("Parent namespace {} does not exist", parent),
                }
            }
            None => id.to_string(),
        };
        tx.execute(
            "INSERT INTO namespaces (id, name, parent_id, traversal_ids) VALUES (?1, ?2, ?3, ?4)",
            params![id, name, parent_id, traversal_ids],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn insert_project(&self, id: i64, name: &str, namespace_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO projects (id, name, namespace_id) VALUES (?1, ?2, ?3)",
            params![id, name, namespace_id],
        )?;
        Ok(())
    }

    pub fn insert_runner(
        &self,
        id: i64,
        runner_type: &str,
        description: Option<&str>,
        tags: &[&str],
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO runners (id, runner_type, description) VALUES (?1, ?2, ?3)",
            params![id, runner_type, description],
        )?;
        {
            let mut stmt =
                tx.prepare("INSERT OR IGNORE INTO runner_tags (runner_id, name) VALUES (?1, ?2)")?;
            for tag in tags {
                stmt.execute(params![id, tag])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn insert_runner_manager(&self, manager: &RunnerManagerRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO runner_managers (id, runner_id, system_xid, version, platform, architecture)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                manager.id,
                manager.runner_id,
                manager.system_xid,
                manager.version,
                manager.platform,
                manager.architecture
            ],
        )?;
        Ok(())
    }

    pub fn insert_build(&self, build: &NewBuild) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO builds (id, project_id, pipeline_id, name, stage, status, ref_name,
                                 created_at, queued_at, started_at, runner_id, runner_manager_id, retried)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                build.id,
                build.project_id,
                build.pipeline_id,
                build.name,
                build.stage,
                build.status.as_str(),
                build.ref_name,
                to_micros(&build.created_at),
                build.queued_at.as_ref().map(to_micros),
                build.started_at.as_ref().map(to_micros),
                build.runner_id,
                build.runner_manager_id,
                build.retried as i64,
            ],
        )
        .with_context(|| format!("Failed to insert build {}", build.id))?;
        Ok(())
    }

    pub fn insert_artifact(&self, build_id: i64, file_type: &str, size: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO job_artifacts (build_id, file_type, size) VALUES (?1, ?2, ?3)",
            params![build_id, file_type, size],
        )?;
        Ok(())
    }

    /// Marks a build as replaced by a newer attempt.
    pub fn mark_retried(&self, build_id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE builds SET retried = 1 WHERE id = ?1",
            params![build_id],
        )?;
        Ok(changed > 0)
    }

    /// Transitions a build to a finished status and appends its sync event in
    /// the same transaction. Returns false when the build does not exist.
    pub fn finish_build(
        &self,
        build_id: i64,
        status: BuildStatus,
        finished_at: DateTime<Utc>,
    ) -> Result<bool> {
        if !status.is_finished() {
            bail!("{} is not a finished status", status.as_str());
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let project_id: Option<i64> = tx
            .query_row(
                "SELECT project_id FROM builds WHERE id = ?1",
                params![build_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(project_id) = project_id else {
            return Ok(false);
        };
        let finished_micros = to_micros(&finished_at);
        tx.execute(
            "UPDATE builds SET status = ?1, finished_at = ?2 WHERE id = ?3",
            params![status.as_str(), finished_micros, build_id],
        )?;
        tx.execute(
            "INSERT INTO finished_build_sync_events (source_id, project_id, ready_at)
             VALUES (?1, ?2, ?3)",
            params![build_id, project_id, finished_micros],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Appends a raw event. Duplicates are allowed.
    pub fn append_sync_event(
        &self,
        source_id: i64,
        project_id: i64,
        ready_at: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO finished_build_sync_events (source_id, project_id, ready_at)
             VALUES (?1, ?2, ?3)",
            params![source_id, project_id, to_micros(&ready_at)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Deletes a build and its artifacts. Its sync events stay behind.
    pub fn delete_build(&self, build_id: i64) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM job_artifacts WHERE build_id = ?1",
            params![build_id],
        )?;
        let deleted = tx.execute("DELETE FROM builds WHERE id = ?1", params![build_id])?;
        tx.commit()?;
        Ok(deleted > 0)
    }

    /// All events of a build, oldest first. Mostly useful for inspection.
    pub fn events_for_source(&self, source_id: i64) -> Result<Vec<SyncEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT source_id, project_id, ready_at, processed
             FROM finished_build_sync_events WHERE source_id = ?1 ORDER BY ready_at, id",
        )?;
        let events = stmt
            .query_map(params![source_id], Self::row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }
}

impl SyncEventLog for SqliteSourceStore {
    fn fetch_unprocessed_after(
        &self,
        shard: ShardSpec,
        after: Option<EventKey>,
        limit: usize,
    ) -> Result<Vec<SyncEvent>> {
        let conn = self.conn.lock().unwrap();
        let (after_ready_at, after_source_id) = match after {
            Some(key) => (Some(key.ready_at_micros), Some(key.source_id)),
            None => (None, None),
        };
        let mut stmt = conn.prepare_cached(
            "SELECT source_id, project_id, ready_at, processed
             FROM finished_build_sync_events
             WHERE processed = 0
               AND ((source_id % ?1) + ?1) % ?1 = ?2
               AND (?3 IS NULL OR ready_at > ?3 OR (ready_at = ?3 AND source_id > ?4))
             ORDER BY ready_at, source_id
             LIMIT ?5",
        )?;
        let events = stmt
            .query_map(
                params![
                    shard.shard_count as i64,
                    shard.shard_id as i64,
                    after_ready_at,
                    after_source_id,
                    limit as i64
                ],
                Self::row_to_event,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read unprocessed sync events")?;
        Ok(events)
    }

    fn mark_processed(&self, keys: &[EventKey]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut changed = 0;
        {
            let mut stmt = tx.prepare_cached(
                "UPDATE finished_build_sync_events SET processed = 1
                 WHERE source_id = ?1 AND ready_at = ?2 AND processed = 0",
            )?;
            for key in keys {
                changed += stmt.execute(params![key.source_id, key.ready_at_micros])?;
            }
        }
        tx.commit().context("Failed to commit sync event acknowledgment")?;
        Ok(changed)
    }

    fn count_unprocessed(&self, shard: Option<ShardSpec>) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = match shard {
            Some(shard) => conn.query_row(
                "SELECT COUNT(*) FROM finished_build_sync_events
                 WHERE processed = 0 AND ((source_id % ?1) + ?1) % ?1 = ?2",
                params![shard.shard_count as i64, shard.shard_id as i64],
                |row| row.get(0),
            )?,
            None => conn.query_row(
                "SELECT COUNT(*) FROM finished_build_sync_events WHERE processed = 0",
                [],
                |row| row.get(0),
            )?,
        };
        Ok(count as usize)
    }
}

impl BuildRecords for SqliteSourceStore {
    fn builds_by_ids(&self, ids: &[i64]) -> Result<Vec<BuildRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM builds WHERE id IN ({})",
            BUILD_COLUMNS,
            placeholders(ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let builds = stmt
            .query_map(params_from_iter(ids.iter()), Self::row_to_build)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(builds)
    }

    fn project_namespaces(&self, project_ids: &[i64]) -> Result<Vec<ProjectNamespace>> {
        if project_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT p.id, n.traversal_ids FROM projects p
             JOIN namespaces n ON n.id = p.namespace_id
             WHERE p.id IN ({})",
            placeholders(project_ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let namespaces = stmt
            .query_map(params_from_iter(project_ids.iter()), |row| {
                let raw: String = row.get(1)?;
                Ok(ProjectNamespace {
                    project_id: row.get(0)?,
                    traversal_ids: Self::parse_traversal_ids(&raw),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(namespaces)
    }

    fn runners_by_ids(&self, ids: &[i64]) -> Result<Vec<RunnerRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT id, runner_type, description FROM runners WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let runners = stmt
            .query_map(params_from_iter(ids.iter()), |row| {
                Ok(RunnerRecord {
                    id: row.get(0)?,
                    runner_type: row.get(1)?,
                    description: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runners)
    }

    fn runner_tags(&self, runner_ids: &[i64]) -> Result<Vec<RunnerTag>> {
        if runner_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT runner_id, name FROM runner_tags WHERE runner_id IN ({}) ORDER BY runner_id, name",
            placeholders(runner_ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let tags = stmt
            .query_map(params_from_iter(runner_ids.iter()), |row| {
                Ok(RunnerTag {
                    runner_id: row.get(0)?,
                    name: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tags)
    }

    fn runner_managers_by_ids(&self, ids: &[i64]) -> Result<Vec<RunnerManagerRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT id, runner_id, system_xid, version, platform, architecture
             FROM runner_managers WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let managers = stmt
            .query_map(params_from_iter(ids.iter()), |row| {
                Ok(RunnerManagerRecord {
                    id: row.get(0)?,
                    runner_id: row.get(1)?,
                    system_xid: row.get(2)?,
                    version: row.get(3)?,
                    platform: row.get(4)?,
                    architecture: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(managers)
    }

    fn retried_counts(&self, pipeline_ids: &[i64]) -> Result<Vec<RetryCount>> {
        if pipeline_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT pipeline_id, name, COUNT(*) FROM builds
             WHERE retried = 1 AND pipeline_id IN ({})
             GROUP BY pipeline_id, name",
            placeholders(pipeline_ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let counts = stmt
            .query_map(params_from_iter(pipeline_ids.iter()), |row| {
                Ok(RetryCount {
                    pipeline_id: row.get(0)?,
                    name: row.get(1)?,
                    retried: row.get::<_, i64>(2)? as u32,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(counts)
    }

    fn artifact_summaries(&self, build_ids: &[i64]) -> Result<Vec<ArtifactSummary>> {
        if build_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT build_id, COUNT(*), COALESCE(SUM(size), 0), GROUP_CONCAT(DISTINCT file_type)
             FROM job_artifacts WHERE build_id IN ({})
             GROUP BY build_id",
            placeholders(build_ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let summaries = stmt
            .query_map(params_from_iter(build_ids.iter()), |row| {
                let file_types: Option<String> = row.get(3)?;
                let mut file_types: Vec<String> = file_types
                    .map(|s| s.split(',').map(|t| t.to_string()).collect())
                    .unwrap_or_default();
                file_types.sort();
                Ok(ArtifactSummary {
                    build_id: row.get(0)?,
                    count: row.get::<_, i64>(1)? as u32,
                    size_bytes: row.get(2)?,
                    file_types,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(summaries)
    }
}
