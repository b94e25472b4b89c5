use chrono::{DateTime, Utc};

use crate::error::{CoverageError, CoverageResult};

pub const FUNCTION_NAME_VAR: &str = "AWS_LAMBDA_FUNCTION_NAME";
pub const LOG_STREAM_VAR: &str = "AWS_LAMBDA_LOG_STREAM_NAME";

pub const UNKNOWN_COMPONENT: &str = "unknown";
pub const INVOCATION_KEY_SUFFIX: &str = ".coverage";

const COVERAGE_FILE_PREFIXES: [&str; 3] = ["coverage-", "combined-coverage", "coverage_"];
const EXCLUDED_FILE_MARKERS: [&str; 4] = [".tmp", ".bak", ".backup", "~"];
const FUNCTION_ROLE_WORDS: [&str; 6] = [
    "function", "lambda", "handler", "service", "api", "worker",
];
const MAX_EXECUTION_ID_LEN: usize = 20;

/// Identity the execution platform exposes through the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlatformIdentity {
    pub function_name: Option<String>,
    pub log_stream: Option<String>,
}

impl PlatformIdentity {
    pub fn from_env() -> Self {
        Self {
            function_name: std::env::var(FUNCTION_NAME_VAR).ok(),
            log_stream: std::env::var(LOG_STREAM_VAR).ok(),
        }
    }

    pub fn function_name_or_unknown(&self) -> String {
        self.function_name
            .as_deref()
            .map(sanitize_key_component)
            .unwrap_or_else(|| UNKNOWN_COMPONENT.to_string())
    }
}

/// Function and execution identity inferred from a coverage object key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyIdentity {
    pub function_name: Option<String>,
    pub execution_id: Option<String>,
}

pub fn normalize_prefix(prefix: &str) -> String {
    if prefix.is_empty() || prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{prefix}/")
    }
}

/// Replaces characters outside `[A-Za-z0-9._-]` with `_` and trims
/// leading/trailing underscores. Empty results become `unknown`.
pub fn sanitize_key_component(component: &str) -> String {
    let replaced: String = component
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '.' | '_') {
                ch
            } else {
                '_'
            }
        })
        .collect();

    let trimmed = replaced.trim_matches('_');
    if trimmed.is_empty() {
        UNKNOWN_COMPONENT.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Millisecond precision, lexically sortable and filesystem safe.
pub fn key_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.format("%Y%m%d_%H%M%S_%3f").to_string()
}

pub fn invocation_object_key(
    prefix: &str,
    function_name: &str,
    execution_id: &str,
    timestamp: DateTime<Utc>,
) -> String {
    format!(
        "{}{}/{}_{}{INVOCATION_KEY_SUFFIX}",
        normalize_prefix(prefix),
        sanitize_key_component(function_name),
        key_timestamp(timestamp),
        sanitize_key_component(execution_id),
    )
}

pub fn generate_key(
    function_name: Option<&str>,
    execution_id: Option<&str>,
    prefix: &str,
    timestamp: Option<DateTime<Utc>>,
) -> CoverageResult<String> {
    generate_key_with_platform(
        &PlatformIdentity::from_env(),
        function_name,
        execution_id,
        prefix,
        timestamp,
    )
}

pub fn generate_key_with_platform(
    platform: &PlatformIdentity,
    function_name: Option<&str>,
    execution_id: Option<&str>,
    prefix: &str,
    timestamp: Option<DateTime<Utc>>,
) -> CoverageResult<String> {
    let function_name = function_name
        .or(platform.function_name.as_deref())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| {
            CoverageError::Identity(format!(
                "function name must be provided or {FUNCTION_NAME_VAR} must be set"
            ))
        })?;

    let execution_id = execution_id
        .or(platform.log_stream.as_deref())
        .unwrap_or(UNKNOWN_COMPONENT);

    let key = invocation_object_key(
        prefix,
        function_name,
        execution_id,
        timestamp.unwrap_or_else(Utc::now),
    );
    tracing::debug!(key = %key, "storage key generated");
    Ok(key)
}

pub fn combined_report_key(prefix: &str, timestamp: DateTime<Utc>) -> String {
    format!(
        "{}combined-coverage-{}.json",
        normalize_prefix(prefix),
        timestamp.format("%Y%m%d_%H%M%S"),
    )
}

/// Local file name for a serialized report or its fallback copy.
pub fn report_file_name(function_name: &str, short_id: &str) -> String {
    format!(
        "coverage-{}-{}.json",
        sanitize_key_component(function_name),
        sanitize_key_component(short_id),
    )
}

fn file_name_of(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Whether an object key follows the coverage-file naming convention.
pub fn is_coverage_object_key(key: &str) -> bool {
    if key.ends_with('/') {
        return false;
    }

    let file_name = file_name_of(key).to_ascii_lowercase();
    let Some((_, extension)) = file_name.rsplit_once('.') else {
        return false;
    };
    if extension != "json" {
        return false;
    }

    if !COVERAGE_FILE_PREFIXES
        .iter()
        .any(|prefix| file_name.starts_with(prefix))
    {
        return false;
    }

    !EXCLUDED_FILE_MARKERS
        .iter()
        .any(|marker| file_name.contains(marker))
}

/// Best-effort split of `coverage-{function}-{execution}.json`.
///
/// The trailing hyphen segment counts as an execution id only when it is
/// short, mostly alphanumeric, and not a common function-role word. A
/// function name that itself ends in such a token is indistinguishable
/// from one carrying an execution id.
pub fn parse_coverage_key(key: &str) -> KeyIdentity {
    let file_name = file_name_of(key);
    let stem = file_name
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(file_name);
    let remainder = stem.strip_prefix("coverage-").unwrap_or(stem);

    if remainder.is_empty() {
        return KeyIdentity::default();
    }

    let Some((function_name, candidate)) = remainder.rsplit_once('-') else {
        return KeyIdentity {
            function_name: Some(remainder.to_string()),
            execution_id: None,
        };
    };

    if looks_like_execution_id(candidate) && !function_name.is_empty() {
        KeyIdentity {
            function_name: Some(function_name.to_string()),
            execution_id: Some(candidate.to_string()),
        }
    } else {
        KeyIdentity {
            function_name: Some(remainder.to_string()),
            execution_id: None,
        }
    }
}

fn looks_like_execution_id(candidate: &str) -> bool {
    let total = candidate.chars().count();
    if total == 0 || total > MAX_EXECUTION_ID_LEN {
        return false;
    }

    let lowered = candidate.to_ascii_lowercase();
    if FUNCTION_ROLE_WORDS.contains(&lowered.as_str()) {
        return false;
    }

    let alphanumeric = candidate.chars().filter(|ch| ch.is_alphanumeric()).count();
    (alphanumeric as f64) / (total as f64) > 0.7
}
