//! Environment-derived settings for coverage collection and upload.
//!
//! Resolution is a pure function over a key lookup so it can be exercised
//! without touching the process environment; [`resolve`] binds it to
//! `std::env` and caches the validated result for the lifetime of the
//! worker process.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;

use crate::error::{CoverageError, CoverageResult};

pub const BUCKET_VAR: &str = "COVERAGE_S3_BUCKET";
pub const PREFIX_VAR: &str = "COVERAGE_S3_PREFIX";
pub const UPLOAD_TIMEOUT_VAR: &str = "COVERAGE_UPLOAD_TIMEOUT";
pub const INCLUDE_PATTERNS_VAR: &str = "COVERAGE_INCLUDE_PATTERNS";
pub const EXCLUDE_PATTERNS_VAR: &str = "COVERAGE_EXCLUDE_PATTERNS";
pub const BRANCH_COVERAGE_VAR: &str = "COVERAGE_BRANCH_COVERAGE";
pub const LOG_LEVEL_VAR: &str = "COVERAGE_LOG_LEVEL";

pub const DEFAULT_PREFIX: &str = "coverage/";
pub const DEFAULT_UPLOAD_TIMEOUT_SECONDS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Settings {
    pub bucket: String,
    pub prefix: String,
    pub upload_timeout_seconds: i64,
    pub include_patterns: Option<Vec<String>>,
    pub exclude_patterns: Option<Vec<String>>,
    pub track_branches: bool,
}

impl Settings {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: DEFAULT_PREFIX.to_string(),
            upload_timeout_seconds: DEFAULT_UPLOAD_TIMEOUT_SECONDS,
            include_patterns: None,
            exclude_patterns: None,
            track_branches: true,
        }
    }

    /// Builds and validates settings from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> CoverageResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bucket = lookup(BUCKET_VAR)
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| {
                CoverageError::Configuration(format!(
                    "{BUCKET_VAR} environment variable is required"
                ))
            })?;

        let prefix = lookup(PREFIX_VAR).unwrap_or_else(|| DEFAULT_PREFIX.to_string());

        let upload_timeout_seconds = match lookup(UPLOAD_TIMEOUT_VAR) {
            Some(raw) => raw.trim().parse::<i64>().map_err(|error| {
                CoverageError::Configuration(format!(
                    "{UPLOAD_TIMEOUT_VAR} must be whole seconds, got '{raw}': {error}"
                ))
            })?,
            None => DEFAULT_UPLOAD_TIMEOUT_SECONDS,
        };

        let track_branches = lookup(BRANCH_COVERAGE_VAR)
            .map(|raw| parse_flag(&raw))
            .unwrap_or(true);

        let mut settings = Self {
            bucket,
            prefix,
            upload_timeout_seconds,
            include_patterns: lookup(INCLUDE_PATTERNS_VAR).and_then(|raw| split_patterns(&raw)),
            exclude_patterns: lookup(EXCLUDE_PATTERNS_VAR).and_then(|raw| split_patterns(&raw)),
            track_branches,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_env() -> CoverageResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Checks invariants and normalizes the prefix to end with `/`.
    ///
    /// Calling this repeatedly is a no-op after the first success.
    pub fn validate(&mut self) -> CoverageResult<()> {
        if self.bucket.trim().is_empty() {
            return Err(CoverageError::Configuration(
                "bucket cannot be empty".to_string(),
            ));
        }

        if self.upload_timeout_seconds <= 0 {
            return Err(CoverageError::Configuration(format!(
                "upload timeout must be positive, got {}",
                self.upload_timeout_seconds
            )));
        }

        for pattern in self
            .include_patterns
            .iter()
            .chain(self.exclude_patterns.iter())
            .flatten()
        {
            glob::Pattern::new(pattern).map_err(|error| {
                CoverageError::Configuration(format!("invalid source pattern '{pattern}': {error}"))
            })?;
        }

        if !self.prefix.ends_with('/') {
            self.prefix.push('/');
        }

        Ok(())
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_seconds.max(0) as u64)
    }
}

fn parse_flag(raw: &str) -> bool {
    raw.trim().eq_ignore_ascii_case("true")
}

fn split_patterns(raw: &str) -> Option<Vec<String>> {
    let patterns: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|pattern| !pattern.is_empty())
        .map(str::to_string)
        .collect();

    if patterns.is_empty() {
        None
    } else {
        Some(patterns)
    }
}

static CACHED: Mutex<Option<Arc<Settings>>> = Mutex::new(None);

/// Returns the process-wide settings, resolving them from the environment
/// on first use.
pub fn resolve() -> CoverageResult<Arc<Settings>> {
    let mut slot = CACHED.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(settings) = slot.as_ref() {
        return Ok(Arc::clone(settings));
    }

    let settings = Arc::new(Settings::from_env()?);
    tracing::info!(
        bucket = %settings.bucket,
        prefix = %settings.prefix,
        track_branches = settings.track_branches,
        "coverage configuration created"
    );
    *slot = Some(Arc::clone(&settings));
    Ok(settings)
}

pub fn clear_cache() {
    let mut slot = CACHED.lock().unwrap_or_else(PoisonError::into_inner);
    *slot = None;
}
