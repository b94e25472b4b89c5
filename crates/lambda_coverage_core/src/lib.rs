//! Shared coverage lifecycle primitives.
//!
//! This crate owns settings resolution, storage key conventions, execution
//! tracking, the report model, and report validation. It intentionally
//! excludes AWS SDK and Lambda runtime concerns.
//! See `crates/lambda_coverage_core/README.md` for ownership boundaries.

pub mod error;
pub mod probe;
pub mod report;
pub mod settings;
pub mod storage_keys;
pub mod tracker;
pub mod validation;

pub use error::{CoverageError, CoverageResult};
