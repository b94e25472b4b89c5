//! Lambda and S3 integration for invocation-scoped code coverage.
//!
//! This crate owns runtime integration details (the coverage session
//! lifecycle inside a Lambda worker, retrying uploads, local fallback, the
//! combiner and health handlers, and storage adapters) on top of the
//! primitives in `lambda_coverage_core`.
//! See `crates/lambda_coverage_layer/README.md` for ownership boundaries.

pub mod adapters;
pub mod handlers;
pub mod runtime;
pub mod telemetry;

pub use lambda_coverage_core::{cover, cover_branch};
