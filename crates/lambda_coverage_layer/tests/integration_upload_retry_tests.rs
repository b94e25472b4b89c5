mod support;

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use lambda_coverage_core::error::CoverageError;
use lambda_coverage_core::settings::Settings;
use lambda_coverage_layer::adapters::object_store::{PutRequest, StoreErrorKind};
use lambda_coverage_layer::runtime::guard::DeadlineGuard;
use lambda_coverage_layer::runtime::upload::{Uploader, REPORT_CONTENT_TYPE};
use support::reports::line_report_bytes;
use support::stores::{FlakyStore, RecordingSleeper};

fn report_file(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let path = dir.path().join("coverage.json");
    let body = line_report_bytes("src/handler.rs", &[1, 2], &[1, 2, 3]);
    fs::write(&path, body).unwrap();
    path
}

#[test]
fn transient_failures_back_off_one_then_two_seconds() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FlakyStore::new(StoreErrorKind::Throttled, 2));
    let sleeper = Arc::new(RecordingSleeper::default());
    let uploader = Uploader::new(store.clone(), sleeper.clone());

    let result = uploader
        .upload(
            &report_file(&dir),
            Some("coverage/orders/run.coverage"),
            Some(&Settings::new("coverage-bucket")),
            BTreeMap::new(),
            None,
        )
        .unwrap()
        .expect("third attempt succeeds");

    assert_eq!(store.attempts(), 3);
    assert_eq!(
        sleeper.delays(),
        vec![Duration::from_secs(1), Duration::from_secs(2)]
    );
    assert_eq!(result.key, "coverage/orders/run.coverage");
    let puts = store.puts();
    assert_eq!(puts.len(), 1);
    assert_eq!(puts[0].metadata["file-size"], result.byte_size.to_string());
    assert!(puts[0].metadata.contains_key("upload-timestamp"));
}

#[test]
fn exhausted_retries_report_failure_without_a_fourth_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FlakyStore::always(StoreErrorKind::Transport));
    let sleeper = Arc::new(RecordingSleeper::default());
    let uploader = Uploader::new(store.clone(), sleeper.clone());

    let outcome = uploader
        .upload(
            &report_file(&dir),
            Some("coverage/orders/run.coverage"),
            Some(&Settings::new("coverage-bucket")),
            BTreeMap::new(),
            None,
        )
        .unwrap();

    assert_eq!(outcome, None);
    assert_eq!(store.attempts(), 3);
    assert_eq!(sleeper.delays().len(), 2);
}

#[test]
fn permission_errors_are_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    for kind in [
        StoreErrorKind::AccessDenied,
        StoreErrorKind::BucketNotFound,
        StoreErrorKind::InvalidBucketName,
        StoreErrorKind::LocalIo,
    ] {
        let store = Arc::new(FlakyStore::always(kind));
        let sleeper = Arc::new(RecordingSleeper::default());
        let uploader = Uploader::new(store.clone(), sleeper.clone());

        let outcome = uploader
            .upload(
                &report_file(&dir),
                Some("coverage/orders/run.coverage"),
                Some(&Settings::new("coverage-bucket")),
                BTreeMap::new(),
                None,
            )
            .unwrap();

        assert_eq!(outcome, None, "{kind:?}");
        assert_eq!(store.attempts(), 1, "{kind:?}");
        assert!(sleeper.delays().is_empty(), "{kind:?}");
    }
}

#[test]
fn backoff_is_cut_short_by_the_deadline() {
    let dir = tempfile::tempdir().unwrap();
    let source = report_file(&dir);
    let store = Arc::new(FlakyStore::always(StoreErrorKind::Throttled));
    let sleeper = Arc::new(RecordingSleeper::advancing());
    let uploader = Uploader::new(store.clone(), sleeper.clone());
    let metadata = BTreeMap::new();
    let request = PutRequest {
        bucket: "coverage-bucket",
        key: "coverage/orders/run.coverage",
        source: &source,
        metadata: &metadata,
        content_type: REPORT_CONTENT_TYPE,
    };

    let error = uploader
        .put_with_retry(&request, &DeadlineGuard::from_seconds("upload", 0.25))
        .expect_err("deadline expires during the first backoff");

    assert!(matches!(error, CoverageError::Timeout { .. }), "{error}");
    assert_eq!(store.attempts(), 1);
    let delays = sleeper.delays();
    assert_eq!(delays.len(), 1);
    assert!(delays[0] <= Duration::from_millis(250), "{delays:?}");
}

#[test]
fn deadline_expiry_mid_retry_degrades_to_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FlakyStore::always(StoreErrorKind::Transport));
    let sleeper = Arc::new(RecordingSleeper::advancing());
    let uploader = Uploader::new(store.clone(), sleeper.clone());

    let outcome = uploader
        .upload(
            &report_file(&dir),
            Some("coverage/orders/run.coverage"),
            Some(&Settings::new("coverage-bucket")),
            BTreeMap::new(),
            Some(0.25),
        )
        .unwrap();

    assert_eq!(outcome, None);
    assert_eq!(store.attempts(), 1);
    assert!(
        sleeper.delays().iter().sum::<Duration>() <= Duration::from_millis(250)
    );
}

#[test]
fn missing_or_empty_reports_are_rejected_before_any_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FlakyStore::new(StoreErrorKind::Transport, 0));
    let uploader = Uploader::new(store.clone(), Arc::new(RecordingSleeper::default()));
    let settings = Settings::new("coverage-bucket");

    let missing = uploader.upload(
        &dir.path().join("absent.json"),
        None,
        Some(&settings),
        BTreeMap::new(),
        None,
    );
    assert!(missing.is_err());

    let empty = dir.path().join("empty.json");
    fs::write(&empty, b"").unwrap();
    assert!(uploader
        .upload(&empty, None, Some(&settings), BTreeMap::new(), None)
        .is_err());

    assert_eq!(store.attempts(), 0);
}

#[test]
fn detached_upload_completes_on_its_own_thread() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FlakyStore::new(StoreErrorKind::Transport, 0));
    let uploader = Uploader::new(store.clone(), Arc::new(RecordingSleeper::default()));

    uploader
        .upload_detached(
            report_file(&dir),
            Some("coverage/orders/background.coverage".to_string()),
            Some(Settings::new("coverage-bucket")),
            BTreeMap::from([("coverage-type".to_string(), "invocation".to_string())]),
        )
        .join()
        .expect("upload thread");

    let puts = store.puts();
    assert_eq!(puts.len(), 1);
    assert_eq!(puts[0].key, "coverage/orders/background.coverage");
    assert_eq!(puts[0].metadata["coverage-type"], "invocation");
}
