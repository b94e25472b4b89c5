use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use lambda_coverage_core::settings::{
    Settings, BRANCH_COVERAGE_VAR, BUCKET_VAR, PREFIX_VAR, UPLOAD_TIMEOUT_VAR,
};
use lambda_coverage_core::storage_keys::{FUNCTION_NAME_VAR, LOG_STREAM_VAR, UNKNOWN_COMPONENT};
use lambda_runtime::LambdaEvent;
use serde::Serialize;
use serde_json::{json, Value};

use crate::runtime::invocation::CoverageRuntime;
use crate::runtime::session::{SessionManager, SessionState};

pub const LAYER_VERSION: &str = env!("CARGO_PKG_VERSION");

const REPORTED_ENV_VARS: [&str; 9] = [
    FUNCTION_NAME_VAR,
    "AWS_LAMBDA_FUNCTION_VERSION",
    "AWS_LAMBDA_LOG_GROUP_NAME",
    LOG_STREAM_VAR,
    "AWS_REGION",
    BUCKET_VAR,
    PREFIX_VAR,
    UPLOAD_TIMEOUT_VAR,
    BRANCH_COVERAGE_VAR,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthDetails {
    pub coverage_active: bool,
    pub function_name: String,
    pub environment_vars: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheckResponse {
    pub status: HealthStatus,
    pub coverage_enabled: bool,
    pub layer_version: String,
    pub s3_config: Value,
    pub timestamp: DateTime<Utc>,
    pub errors: Vec<String>,
    pub details: HealthDetails,
}

/// Shows the first and last three characters of longer values, `***`
/// otherwise.
pub fn mask_value(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 6 {
        return "***".to_string();
    }
    let head: String = chars[..3].iter().collect();
    let tail: String = chars[chars.len() - 3..].iter().collect();
    format!("{head}...{tail}")
}

pub fn health_check(runtime: &CoverageRuntime) -> HealthCheckResponse {
    health_check_with_lookup(runtime.sessions(), |key| std::env::var(key).ok())
}

/// Lambda entry point for the health check.
///
/// The check itself is instrumented only while coverage settings resolve.
/// Without them it runs untracked, so a broken deployment gets an
/// unhealthy response instead of a failed invocation.
pub async fn health_handler(
    runtime: CoverageRuntime,
    event: LambdaEvent<Value>,
) -> Result<HealthCheckResponse, lambda_runtime::Error> {
    if let Err(error) = runtime.settings() {
        tracing::warn!(error = %error, "coverage unavailable; running health check untracked");
        return Ok(health_check(&runtime));
    }

    let reporter = runtime.clone();
    runtime
        .invoke(event, move |_event| async move {
            Ok(health_check(&reporter))
        })
        .await
}

pub fn health_check_with_lookup<F>(sessions: &SessionManager, lookup: F) -> HealthCheckResponse
where
    F: Fn(&str) -> Option<String>,
{
    let coverage_active = sessions.state() == SessionState::Active;
    let mut errors = Vec::new();

    let s3_config = match Settings::from_lookup(&lookup) {
        Ok(settings) => describe_settings(&settings),
        Err(error) => {
            tracing::warn!(error = %error, "coverage configuration invalid");
            errors.push(format!("Configuration error: {error}"));
            json!({ "error": "Configuration not available" })
        }
    };
    let coverage_enabled = errors.is_empty();

    let environment_vars: BTreeMap<String, String> = REPORTED_ENV_VARS
        .iter()
        .filter_map(|name| {
            lookup(name).map(|value| {
                let shown = if name.contains("BUCKET") {
                    mask_value(&value)
                } else {
                    value
                };
                (name.to_string(), shown)
            })
        })
        .collect();

    let status = if coverage_enabled {
        HealthStatus::Healthy
    } else {
        HealthStatus::Unhealthy
    };
    tracing::info!(
        status = ?status,
        coverage_active,
        error_count = errors.len(),
        "health check completed"
    );

    HealthCheckResponse {
        status,
        coverage_enabled,
        layer_version: LAYER_VERSION.to_string(),
        s3_config,
        timestamp: Utc::now(),
        errors,
        details: HealthDetails {
            coverage_active,
            function_name: lookup(FUNCTION_NAME_VAR)
                .unwrap_or_else(|| UNKNOWN_COMPONENT.to_string()),
            environment_vars,
        },
    }
}

fn describe_settings(settings: &Settings) -> Value {
    let mut config = json!({
        "bucket": mask_value(&settings.bucket),
        "prefix": settings.prefix,
        "upload_timeout": settings.upload_timeout_seconds,
        "branch_coverage": settings.track_branches,
        "has_include_patterns": settings.include_patterns.is_some(),
        "has_exclude_patterns": settings.exclude_patterns.is_some(),
    });
    if let Some(patterns) = &settings.include_patterns {
        config["include_pattern_count"] = json!(patterns.len());
    }
    if let Some(patterns) = &settings.exclude_patterns {
        config["exclude_pattern_count"] = json!(patterns.len());
    }
    config
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use lambda_coverage_core::settings::INCLUDE_PATTERNS_VAR;

    use crate::runtime::session::line_tracker_factory;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn sessions() -> (tempfile::TempDir, SessionManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(1, dir.path(), line_tracker_factory());
        (dir, manager)
    }

    #[test]
    fn masks_values_by_length() {
        assert_eq!(mask_value("coverage-bucket-prod"), "cov...rod");
        assert_eq!(mask_value("abcdef"), "***");
        assert_eq!(mask_value(""), "***");
    }

    #[test]
    fn healthy_when_configuration_resolves() {
        let (_dir, sessions) = sessions();
        let response = health_check_with_lookup(
            &sessions,
            lookup_from(&[
                (BUCKET_VAR, "coverage-bucket-prod"),
                (FUNCTION_NAME_VAR, "orders-api"),
                (INCLUDE_PATTERNS_VAR, "src/*.rs,lib/*.rs"),
            ]),
        );

        assert_eq!(response.status, HealthStatus::Healthy);
        assert!(response.coverage_enabled);
        assert!(response.errors.is_empty());
        assert_eq!(response.s3_config["bucket"], "cov...rod");
        assert_eq!(response.s3_config["include_pattern_count"], 2);
        assert_eq!(response.details.function_name, "orders-api");
        assert_eq!(
            response.details.environment_vars[BUCKET_VAR],
            "cov...rod"
        );
        assert!(!response.details.coverage_active);

        let body = serde_json::to_value(&response).unwrap();
        assert_eq!(body["status"], "healthy");
    }

    #[test]
    fn unhealthy_without_bucket() {
        let (_dir, sessions) = sessions();
        let response = health_check_with_lookup(&sessions, lookup_from(&[]));

        assert_eq!(response.status, HealthStatus::Unhealthy);
        assert!(!response.coverage_enabled);
        assert_eq!(response.errors.len(), 1);
        assert_eq!(response.s3_config["error"], "Configuration not available");
        assert_eq!(response.details.function_name, "unknown");
    }
}
