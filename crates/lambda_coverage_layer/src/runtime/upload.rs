use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lambda_coverage_core::error::{CoverageError, CoverageResult};
use lambda_coverage_core::settings::{resolve as resolve_settings, Settings};
use lambda_coverage_core::storage_keys::generate_key;
use tokio::runtime::{Handle, RuntimeFlavor};

use crate::adapters::object_store::{ObjectStore, PutRequest};
use crate::runtime::guard::{DeadlineGuard, GuardedOperation};

pub const MAX_ATTEMPTS: u32 = 3;
pub const BASE_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const REPORT_CONTENT_TYPE: &str = "application/json";

pub trait Sleeper: Send + Sync {
    fn sleep(&self, delay: Duration);
}

/// Blocks the calling thread. Inside a multi-threaded tokio runtime the
/// worker is handed off first so other tasks keep running.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, delay: Duration) {
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| std::thread::sleep(delay))
            }
            _ => std::thread::sleep(delay),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
    pub key: String,
    pub byte_size: u64,
    pub timestamp: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
}

/// Uploads serialized reports with bounded retries.
#[derive(Clone)]
pub struct Uploader {
    store: Arc<dyn ObjectStore>,
    sleeper: Arc<dyn Sleeper>,
}

impl Uploader {
    pub fn new(store: Arc<dyn ObjectStore>, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { store, sleeper }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Up to [`MAX_ATTEMPTS`] puts with 1s, 2s backoff between them. Stops
    /// early on a non-retryable store error or an expired deadline; a
    /// backoff never outlasts the deadline. Returns the number of attempts
    /// used.
    pub fn put_with_retry(
        &self,
        request: &PutRequest<'_>,
        deadline: &DeadlineGuard,
    ) -> CoverageResult<u32> {
        let mut last_error = None;

        for attempt in 1..=MAX_ATTEMPTS {
            deadline.check()?;

            match self.store.put_file(request) {
                Ok(()) => {
                    tracing::info!(
                        bucket = request.bucket,
                        key = request.key,
                        attempt,
                        "coverage object uploaded"
                    );
                    return Ok(attempt);
                }
                Err(error) if !error.kind.is_retryable() => {
                    tracing::error!(
                        bucket = request.bucket,
                        key = request.key,
                        attempt,
                        error_code = error.kind.as_str(),
                        error = %error,
                        "non-retryable storage error"
                    );
                    return Err(CoverageError::Upload {
                        message: error.to_string(),
                        attempts: attempt,
                    });
                }
                Err(error) => {
                    tracing::warn!(
                        bucket = request.bucket,
                        key = request.key,
                        attempt,
                        max_attempts = MAX_ATTEMPTS,
                        error = %error,
                        "upload attempt failed"
                    );
                    if attempt < MAX_ATTEMPTS {
                        let delay = backoff_delay(attempt).min(deadline.remaining());
                        tracing::debug!(delay_seconds = delay.as_secs_f64(), "retrying upload");
                        if !delay.is_zero() {
                            self.sleeper.sleep(delay);
                        }
                    }
                    last_error = Some(error);
                }
            }
        }

        Err(CoverageError::Upload {
            message: last_error
                .map(|error| error.to_string())
                .unwrap_or_else(|| "upload did not run".to_string()),
            attempts: MAX_ATTEMPTS,
        })
    }

    /// Uploads `local_path` and returns `Ok(None)` when the upload failed in
    /// a way the caller should answer with local fallback.
    ///
    /// A missing or empty file is a caller error and is returned before any
    /// attempt. Configuration errors propagate.
    pub fn upload(
        &self,
        local_path: &Path,
        key: Option<&str>,
        settings: Option<&Settings>,
        metadata: BTreeMap<String, String>,
        deadline_seconds: Option<f64>,
    ) -> CoverageResult<Option<UploadResult>> {
        let byte_size = validate_local_file(local_path)?;

        let mut guard = GuardedOperation::new("s3_upload", false);
        guard.run(|| {
            let resolved;
            let settings = match settings {
                Some(settings) => settings,
                None => {
                    resolved = resolve_settings()?;
                    resolved.as_ref()
                }
            };

            let key = match key {
                Some(key) => key.to_string(),
                None => generate_key(None, None, &settings.prefix, None)?,
            };

            let timestamp = Utc::now();
            let mut metadata = metadata;
            metadata
                .entry("upload-timestamp".to_string())
                .or_insert_with(|| timestamp.to_rfc3339());
            metadata
                .entry("file-size".to_string())
                .or_insert_with(|| byte_size.to_string());

            let deadline = DeadlineGuard::from_seconds(
                "s3_upload_with_retries",
                deadline_seconds.unwrap_or(settings.upload_timeout_seconds as f64),
            );
            let request = PutRequest {
                bucket: &settings.bucket,
                key: &key,
                source: local_path,
                metadata: &metadata,
                content_type: REPORT_CONTENT_TYPE,
            };

            tracing::info!(
                bucket = %settings.bucket,
                key = %key,
                file_size_bytes = byte_size,
                "uploading coverage report"
            );
            deadline.run(|deadline| self.put_with_retry(&request, deadline))?;

            Ok(UploadResult {
                key,
                byte_size,
                timestamp,
                metadata,
            })
        })
    }

    /// Runs [`Uploader::upload`] on a detached thread. The outcome is only
    /// logged; nothing guarantees completion before the worker is recycled.
    pub fn upload_detached(
        &self,
        local_path: PathBuf,
        key: Option<String>,
        settings: Option<Settings>,
        metadata: BTreeMap<String, String>,
    ) -> JoinHandle<()> {
        let uploader = self.clone();
        std::thread::spawn(move || {
            let outcome = uploader.upload(
                &local_path,
                key.as_deref(),
                settings.as_ref(),
                metadata,
                None,
            );
            match outcome {
                Ok(Some(result)) => {
                    tracing::info!(key = %result.key, "background upload completed")
                }
                Ok(None) => tracing::warn!(
                    path = %local_path.display(),
                    "background upload failed"
                ),
                Err(error) => tracing::error!(
                    path = %local_path.display(),
                    error = %error,
                    "background upload aborted"
                ),
            }
        })
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    BASE_RETRY_DELAY * 2u32.pow(attempt - 1)
}

fn validate_local_file(path: &Path) -> CoverageResult<u64> {
    let metadata = fs::metadata(path).map_err(|_| {
        CoverageError::Validation(format!("coverage file not found: {}", path.display()))
    })?;
    if !metadata.is_file() || metadata.len() == 0 {
        return Err(CoverageError::Validation(format!(
            "coverage file is empty: {}",
            path.display()
        )));
    }
    Ok(metadata.len())
}
