//! SQLite schema for the coordination database shared by all workers.
//!
//! Holds per-shard leases plus the job run history and audit log.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};

// =============================================================================
// Version 1 - Leases and job runs
// =============================================================================

/// One row per held (or expired, not yet taken over) lease.
const LEASES_TABLE_V1: Table = Table {
    name: "leases",
    columns: &[
        sqlite_column!("key", &SqlType::Text, is_primary_key = true),
        sqlite_column!("holder_id", &SqlType::Text, non_null = true),
        // Milliseconds since the epoch
        sqlite_column!("acquired_at", &SqlType::Integer, non_null = true),
        sqlite_column!("expires_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[],
};

const JOB_RUNS_TABLE_V1: Table = Table {
    name: "job_runs",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true), // AUTOINCREMENT
        sqlite_column!("job_id", &SqlType::Text, non_null = true),
        sqlite_column!("started_at", &SqlType::Text, non_null = true),
        sqlite_column!("finished_at", &SqlType::Text),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("error_message", &SqlType::Text),
        sqlite_column!("triggered_by", &SqlType::Text, non_null = true),
    ],
    indices: &[
        ("idx_job_runs_job_id_started", "job_id, started_at DESC"),
        ("idx_job_runs_status", "status"),
    ],
    unique_constraints: &[],
};

// =============================================================================
// Version 2 - Job audit log
// =============================================================================

const JOB_AUDIT_LOG_TABLE_V2: Table = Table {
    name: "job_audit_log",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true), // AUTOINCREMENT
        sqlite_column!("job_id", &SqlType::Text, non_null = true),
        sqlite_column!("event_type", &SqlType::Text, non_null = true),
        sqlite_column!("timestamp", &SqlType::Text, non_null = true),
        sqlite_column!("duration_ms", &SqlType::Integer),
        sqlite_column!("details", &SqlType::Text),
        sqlite_column!("error", &SqlType::Text),
    ],
    indices: &[
        ("idx_job_audit_log_job_id", "job_id"),
        ("idx_job_audit_log_timestamp", "timestamp DESC"),
    ],
    unique_constraints: &[],
};

/// Migration from version 1 to version 2: add job_audit_log table
fn migrate_v1_to_v2(conn: &rusqlite::Connection) -> anyhow::Result<()> {
    JOB_AUDIT_LOG_TABLE_V2.create(conn)?;
    Ok(())
}

pub const STATE_VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 1,
        tables: &[LEASES_TABLE_V1, JOB_RUNS_TABLE_V1],
        migration: None,
    },
    VersionedSchema {
        version: 2,
        tables: &[LEASES_TABLE_V1, JOB_RUNS_TABLE_V1, JOB_AUDIT_LOG_TABLE_V2],
        migration: Some(migrate_v1_to_v2),
    },
];
