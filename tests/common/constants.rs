//! Shared constants for end-to-end tests
//!
//! When the fixture layout changes (namespaces, runners, timestamps),
//! update only this file.

// ============================================================================
// Source database layout
// ============================================================================

/// Top-level group owning the test project
pub const ROOT_NAMESPACE_ID: i64 = 1;

/// Subgroup directly holding the test project
pub const SUB_NAMESPACE_ID: i64 = 2;

/// Project every fixture build belongs to
pub const PROJECT_ID: i64 = 10;

/// Runner executing every fixture build
pub const RUNNER_ID: i64 = 1;

/// Runner manager (machine) executing every fixture build
pub const RUNNER_MANAGER_ID: i64 = 100;

/// Tags attached to the test runner
pub const RUNNER_TAGS: [&str; 2] = ["docker", "linux"];

/// Expected `namespace_path` of every synced row
pub const NAMESPACE_PATH: &str = "1/2/";

// ============================================================================
// Build ids
// ============================================================================

/// Retried predecessors are numbered from here so they never collide with
/// the finished builds under test.
pub const RETRIED_BUILD_ID_BASE: i64 = 10_000;

// ============================================================================
// Timestamps
// ============================================================================

/// Unix time of the fixture epoch; build `n` finishes `n` seconds later.
pub const BASE_TIMESTAMP: i64 = 1_700_000_000;
