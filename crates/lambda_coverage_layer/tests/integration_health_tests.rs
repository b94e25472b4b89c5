mod support;

use std::sync::Arc;

use lambda_coverage_core::settings::{Settings, BUCKET_VAR};
use lambda_coverage_layer::handlers::health::{health_handler, HealthStatus};
use lambda_coverage_layer::runtime::fallback::FallbackStore;
use lambda_coverage_layer::runtime::invocation::CoverageRuntime;
use lambda_coverage_layer::runtime::session::{line_tracker_factory, SessionManager, SessionState};
use lambda_runtime::{Context, LambdaEvent};
use serde_json::json;
use support::stores::RecordingStore;
use tempfile::TempDir;

// Nothing in this binary sets the bucket variable.
fn runtime_without_bucket() -> (TempDir, Arc<SessionManager>, CoverageRuntime) {
    std::env::remove_var(BUCKET_VAR);
    let scratch = tempfile::tempdir().expect("scratch dir");
    let sessions = Arc::new(SessionManager::new(
        11,
        scratch.path().join("reports"),
        line_tracker_factory(),
    ));
    let runtime = CoverageRuntime::new(
        Arc::new(RecordingStore::default()),
        Arc::clone(&sessions),
        FallbackStore::new(scratch.path().join("fallback")),
    );
    (scratch, sessions, runtime)
}

fn health_event(request_id: &str) -> LambdaEvent<serde_json::Value> {
    let mut context = Context::default();
    context.request_id = request_id.to_string();
    LambdaEvent::new(json!({}), context)
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_bucket_is_reported_as_unhealthy() {
    let (_scratch, sessions, runtime) = runtime_without_bucket();

    let response = health_handler(runtime, health_event("req-health-1"))
        .await
        .expect("health check answers without coverage configuration");

    assert_eq!(response.status, HealthStatus::Unhealthy);
    assert!(!response.coverage_enabled);
    assert!(response.errors[0].contains(BUCKET_VAR));
    assert_eq!(response.s3_config["error"], "Configuration not available");
    assert!(!response.details.coverage_active);
    assert_eq!(sessions.state(), SessionState::Uninitialized);

    let body = serde_json::to_value(&response).unwrap();
    assert_eq!(body["status"], "unhealthy");
}

#[tokio::test(flavor = "multi_thread")]
async fn configured_runtime_tracks_the_health_check() {
    let (_scratch, sessions, runtime) = runtime_without_bucket();
    let runtime = runtime.with_settings(Settings::new("coverage-bucket"));

    let response = health_handler(runtime, health_event("req-health-2"))
        .await
        .expect("health check answers");

    assert!(response.details.coverage_active);
    assert_eq!(sessions.state(), SessionState::Uninitialized);
}
