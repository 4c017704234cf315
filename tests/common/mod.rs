//! Common test infrastructure
//!
//! Tests should only import from this module, not from internal submodules.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{settings, TestEnv};
//!
//! #[test]
//! fn test_sync() {
//!     let env = TestEnv::new();
//!     env.add_finished_builds(1..=3);
//!     let summary = env.orchestrator(settings(2, 1)).run(Default::default()).unwrap();
//!     assert_eq!(summary.records_inserted, 3);
//! }
//! ```

#![allow(dead_code)]

mod constants;
mod doubles;
mod fixtures;

pub use constants::*;
pub use doubles::{
    BlockingDestination, CountingRecords, FailingDestination, HookedDestination, SteppingClock,
};
pub use fixtures::{at, insert_finished_build, settings, time_boxed_settings, TestEnv};
