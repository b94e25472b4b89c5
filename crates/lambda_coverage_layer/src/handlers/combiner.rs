use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use lambda_coverage_core::error::{CoverageError, CoverageResult};
use lambda_coverage_core::report::{content_fingerprint, CoverageReport};
use lambda_coverage_core::settings::{DEFAULT_PREFIX, DEFAULT_UPLOAD_TIMEOUT_SECONDS};
use lambda_coverage_core::storage_keys::{
    combined_report_key, is_coverage_object_key, normalize_prefix, parse_coverage_key,
    UNKNOWN_COMPONENT,
};
use lambda_coverage_core::validation::{validate_integrity, validate_structure};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::adapters::object_store::{ObjectSummary, PutRequest};
use crate::runtime::context::InvocationContext;
use crate::runtime::guard::DeadlineGuard;
use crate::runtime::upload::{Uploader, REPORT_CONTENT_TYPE};

const MAX_ERROR_DETAILS: usize = 5;
const GENERATED_BY: &str = "lambda-coverage-layer";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CombineRequestError {
    #[error("bucket_name is required in event")]
    MissingBucket,
    #[error("max_files must be a positive integer")]
    InvalidMaxFiles,
    #[error("event must be a JSON object")]
    NotAnObject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CombineRequest {
    pub bucket: String,
    pub prefix: String,
    pub output_key: Option<String>,
    pub max_files: Option<usize>,
}

impl CombineRequest {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: DEFAULT_PREFIX.to_string(),
            output_key: None,
            max_files: None,
        }
    }

    pub fn from_event(event: &Value) -> Result<Self, CombineRequestError> {
        let object = event.as_object().ok_or(CombineRequestError::NotAnObject)?;

        let bucket = object
            .get("bucket_name")
            .and_then(Value::as_str)
            .filter(|bucket| !bucket.is_empty())
            .ok_or(CombineRequestError::MissingBucket)?;

        let max_files = match object.get("max_files") {
            None | Some(Value::Null) => None,
            Some(value) => match value.as_u64() {
                Some(count) if count > 0 => Some(count as usize),
                _ => return Err(CombineRequestError::InvalidMaxFiles),
            },
        };

        Ok(Self {
            bucket: bucket.to_string(),
            prefix: object
                .get("prefix")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_PREFIX)
                .to_string(),
            output_key: object
                .get("output_key")
                .and_then(Value::as_str)
                .filter(|key| !key.is_empty())
                .map(str::to_string),
            max_files,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadedFileInfo {
    pub remote_key: String,
    #[serde(skip)]
    pub local_path: PathBuf,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub function_name: Option<String>,
    pub execution_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedFile {
    pub remote_key: String,
    pub size: u64,
    pub function_name: Option<String>,
    pub reason: String,
}

impl RejectedFile {
    fn from_info(info: &DownloadedFileInfo, reason: impl Into<String>) -> Self {
        Self {
            remote_key: info.remote_key.clone(),
            size: info.size,
            function_name: info.function_name.clone(),
            reason: reason.into(),
        }
    }

    fn detail(&self) -> String {
        format!("Invalid file {}: {}", self.remote_key, self.reason)
    }
}

/// A downloaded file that passed structural validation.
#[derive(Debug, Clone)]
pub struct DownloadedFile {
    pub info: DownloadedFileInfo,
    pub document: Value,
}

/// A file that passed both validation passes.
#[derive(Debug, Clone)]
pub struct ValidatedFile {
    pub info: DownloadedFileInfo,
    pub report: CoverageReport,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeStatistics {
    pub files_processed: usize,
    pub files_skipped: usize,
    pub total_coverage_percentage: f64,
    pub functions_merged: Vec<String>,
    pub function_count: usize,
    pub total_size_bytes: u64,
    pub combined_file_size: u64,
    pub earliest_modified: Option<DateTime<Utc>>,
    pub latest_modified: Option<DateTime<Utc>>,
    pub merge_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CombinerResult {
    #[serde(rename = "success")]
    pub succeeded: bool,
    #[serde(rename = "combined_file_key")]
    pub merged_key: String,
    #[serde(rename = "files_processed")]
    pub files_merged_count: usize,
    #[serde(rename = "files_skipped")]
    pub files_rejected_count: usize,
    #[serde(rename = "total_coverage_percentage")]
    pub merged_coverage_percentage: f64,
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_report: Option<Value>,
}

impl CombinerResult {
    pub fn failure(
        merged_key: impl Into<String>,
        files_rejected_count: usize,
        errors: Vec<String>,
    ) -> Self {
        Self {
            succeeded: false,
            merged_key: merged_key.into(),
            files_merged_count: 0,
            files_rejected_count,
            merged_coverage_percentage: 0.0,
            errors,
            merge_report: None,
        }
    }
}

/// Per-file accept/reject summary of one combine run.
pub fn create_merge_report(
    stats: &MergeStatistics,
    valid: &[DownloadedFileInfo],
    invalid: &[RejectedFile],
) -> Value {
    let date_range = stats
        .earliest_modified
        .zip(stats.latest_modified)
        .map(|(earliest, latest)| {
            json!({
                "earliest": earliest.to_rfc3339(),
                "latest": latest.to_rfc3339(),
            })
        });
    let valid_files: Vec<Value> = valid
        .iter()
        .map(|file| {
            json!({
                "s3_key": file.remote_key,
                "function_name": file.function_name,
                "execution_id": file.execution_id,
                "file_size": file.size,
                "last_modified": file.last_modified.map(|stamp| stamp.to_rfc3339()),
            })
        })
        .collect();
    let invalid_files: Vec<Value> = invalid
        .iter()
        .map(|file| {
            json!({
                "s3_key": file.remote_key,
                "error": file.reason,
                "file_size": file.size,
            })
        })
        .collect();

    json!({
        "merge_summary": {
            "total_files_processed": valid.len() + invalid.len(),
            "files_successfully_merged": valid.len(),
            "files_skipped_or_failed": invalid.len(),
            "overall_coverage_percentage": stats.total_coverage_percentage,
            "merge_timestamp": stats.merge_timestamp.to_rfc3339(),
        },
        "merged_functions": {
            "function_names": stats.functions_merged,
            "function_count": stats.function_count,
        },
        "file_statistics": {
            "total_size_bytes": stats.total_size_bytes,
            "combined_file_size_bytes": stats.combined_file_size,
            "date_range": date_range,
        },
        "processing_details": {
            "valid_files": valid_files,
            "invalid_files": invalid_files,
        },
    })
}

/// Discover, download, validate, merge, and re-upload coverage reports.
///
/// Stages are public so each can be driven on its own; [`Combiner::combine`]
/// runs them in order inside a scratch directory that is always removed.
pub struct Combiner {
    uploader: Uploader,
    scratch_parent: PathBuf,
    upload_timeout: Duration,
}

impl Combiner {
    pub fn new(uploader: Uploader) -> Self {
        Self {
            uploader,
            scratch_parent: std::env::temp_dir(),
            upload_timeout: Duration::from_secs(DEFAULT_UPLOAD_TIMEOUT_SECONDS as u64),
        }
    }

    pub fn with_scratch_parent(mut self, parent: impl Into<PathBuf>) -> Self {
        self.scratch_parent = parent.into();
        self
    }

    pub fn discover(
        &self,
        bucket: &str,
        prefix: &str,
        max_files: Option<usize>,
    ) -> CoverageResult<Vec<ObjectSummary>> {
        let prefix = normalize_prefix(prefix);
        let store = self.uploader.store();
        let mut discovered = Vec::new();
        let mut continuation: Option<String> = None;

        'pages: loop {
            let page = store
                .list_objects(bucket, &prefix, continuation.as_deref())
                .map_err(|error| CoverageError::Upload {
                    message: format!("listing s3://{bucket}/{prefix} failed: {error}"),
                    attempts: 1,
                })?;

            for object in page.objects {
                if !is_coverage_object_key(&object.key) {
                    tracing::debug!(key = %object.key, "skipping non-coverage object");
                    continue;
                }
                discovered.push(object);
                if max_files.is_some_and(|cap| discovered.len() >= cap) {
                    tracing::info!(max_files = ?max_files, "reached maximum file limit");
                    break 'pages;
                }
            }

            match page.next_token {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }

        tracing::info!(
            bucket,
            prefix = %prefix,
            files_found = discovered.len(),
            "coverage files discovered"
        );
        Ok(discovered)
    }

    /// Fetches each object into `scratch` and keeps the structurally valid
    /// ones. Every local path created is appended to `created`.
    pub fn download(
        &self,
        bucket: &str,
        objects: &[ObjectSummary],
        scratch: &Path,
        created: &mut Vec<PathBuf>,
    ) -> (Vec<DownloadedFile>, Vec<RejectedFile>) {
        let store = self.uploader.store();
        let mut downloaded = Vec::new();
        let mut rejected = Vec::new();

        for (index, object) in objects.iter().enumerate() {
            let identity = parse_coverage_key(&object.key);
            let file_name = object.key.rsplit('/').next().unwrap_or(&object.key);
            let local_path = scratch.join(format!("{index:05}-{file_name}"));
            let info = DownloadedFileInfo {
                remote_key: object.key.clone(),
                local_path: local_path.clone(),
                size: object.size,
                last_modified: object.last_modified,
                function_name: identity.function_name,
                execution_id: identity.execution_id,
            };

            if let Err(error) = store.get_object_to_file(bucket, &object.key, &local_path) {
                tracing::warn!(
                    key = %object.key,
                    error = %error,
                    "failed to download coverage file"
                );
                rejected.push(RejectedFile::from_info(&info, format!("download failed: {error}")));
                continue;
            }
            created.push(local_path.clone());

            let outcome = fs::read(&local_path)
                .map_err(|error| format!("unreadable download: {error}"))
                .and_then(|bytes| validate_structure(&bytes));
            match outcome {
                Ok(document) => downloaded.push(DownloadedFile { info, document }),
                Err(reason) => {
                    tracing::warn!(
                        key = %object.key,
                        reason = %reason,
                        "dropping malformed coverage file"
                    );
                    rejected.push(RejectedFile::from_info(&info, reason));
                }
            }
        }

        (downloaded, rejected)
    }

    pub fn validate(&self, files: Vec<DownloadedFile>) -> (Vec<ValidatedFile>, Vec<RejectedFile>) {
        let mut valid = Vec::new();
        let mut rejected = Vec::new();

        for file in files {
            let outcome = validate_integrity(&file.document);
            for warning in &outcome.warnings {
                tracing::warn!(
                    key = %file.info.remote_key,
                    warning = %warning,
                    "coverage file integrity warning"
                );
            }
            if !outcome.is_valid() {
                rejected.push(RejectedFile::from_info(&file.info, outcome.errors.join("; ")));
                continue;
            }

            match serde_json::from_value::<CoverageReport>(file.document) {
                Ok(report) => valid.push(ValidatedFile {
                    info: file.info,
                    report,
                }),
                Err(error) => rejected.push(RejectedFile::from_info(
                    &file.info,
                    format!("unsupported report layout: {error}"),
                )),
            }
        }

        (valid, rejected)
    }

    /// Writes the merged report to `destination` and returns its statistics.
    pub fn merge(
        &self,
        valid: &[ValidatedFile],
        skipped: usize,
        destination: &Path,
    ) -> CoverageResult<(CoverageReport, MergeStatistics)> {
        if valid.is_empty() {
            return Err(CoverageError::Validation("nothing to merge".to_string()));
        }

        let merged = CoverageReport::merge_all(valid.iter().map(|file| &file.report));
        let combined_file_size = merged.write_to(destination)?;

        let functions: BTreeSet<String> = valid
            .iter()
            .filter_map(|file| file.info.function_name.clone())
            .collect();
        let stamps = valid.iter().filter_map(|file| file.info.last_modified);

        let stats = MergeStatistics {
            files_processed: valid.len(),
            files_skipped: skipped,
            total_coverage_percentage: merged.totals.percent_covered,
            function_count: functions.len(),
            functions_merged: functions.into_iter().collect(),
            total_size_bytes: valid.iter().map(|file| file.info.size).sum(),
            combined_file_size,
            earliest_modified: stamps.clone().min(),
            latest_modified: stamps.max(),
            merge_timestamp: Utc::now(),
        };
        tracing::info!(
            files_processed = stats.files_processed,
            files_skipped = stats.files_skipped,
            coverage_percentage = stats.total_coverage_percentage,
            "coverage data merged"
        );
        Ok((merged, stats))
    }

    pub fn upload(
        &self,
        source: &Path,
        bucket: &str,
        key: &str,
        stats: &MergeStatistics,
    ) -> CoverageResult<()> {
        let mut metadata = BTreeMap::from([
            (
                "files-processed".to_string(),
                stats.files_processed.to_string(),
            ),
            ("files-skipped".to_string(), stats.files_skipped.to_string()),
            (
                "coverage-percentage".to_string(),
                format!("{:.2}", stats.total_coverage_percentage),
            ),
            (
                "function-count".to_string(),
                stats.function_count.to_string(),
            ),
            ("coverage-type".to_string(), "combined-report".to_string()),
            ("generated-by".to_string(), GENERATED_BY.to_string()),
            ("upload-timestamp".to_string(), Utc::now().to_rfc3339()),
        ]);
        match fs::read(source) {
            Ok(bytes) => {
                metadata.insert("content-sha256".to_string(), content_fingerprint(&bytes));
            }
            Err(error) => tracing::warn!(
                path = %source.display(),
                error = %error,
                "cannot fingerprint combined report"
            ),
        }
        let request = PutRequest {
            bucket,
            key,
            source,
            metadata: &metadata,
            content_type: REPORT_CONTENT_TYPE,
        };
        let deadline = DeadlineGuard::new("combined_report_upload", self.upload_timeout);
        deadline.run(|deadline| self.uploader.put_with_retry(&request, deadline))?;
        Ok(())
    }

    pub fn combine(&self, request: &CombineRequest) -> CombinerResult {
        let started_at = Instant::now();
        tracing::info!(
            bucket = %request.bucket,
            prefix = %request.prefix,
            max_files = ?request.max_files,
            "starting coverage combination"
        );

        let scratch = match tempfile::Builder::new()
            .prefix("coverage-combine-")
            .tempdir_in(&self.scratch_parent)
        {
            Ok(scratch) => scratch,
            Err(error) => {
                return CombinerResult::failure(
                    "",
                    0,
                    vec![format!("Combination failed: cannot create scratch directory: {error}")],
                );
            }
        };

        let mut created = Vec::new();
        let result = self.run_stages(request, scratch.path(), &mut created);

        for path in &created {
            if let Err(error) = fs::remove_file(path) {
                if error.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(
                        path = %path.display(),
                        error = %error,
                        "failed to remove temporary file"
                    );
                }
            }
        }
        if let Err(error) = scratch.close() {
            tracing::warn!(error = %error, "failed to remove combiner scratch directory");
        }

        tracing::info!(
            succeeded = result.succeeded,
            merged_key = %result.merged_key,
            files_merged = result.files_merged_count,
            files_rejected = result.files_rejected_count,
            duration_ms = started_at.elapsed().as_millis() as u64,
            "coverage combination finished"
        );
        result
    }

    fn run_stages(
        &self,
        request: &CombineRequest,
        scratch: &Path,
        created: &mut Vec<PathBuf>,
    ) -> CombinerResult {
        let objects = match self.discover(&request.bucket, &request.prefix, request.max_files) {
            Ok(objects) => objects,
            Err(error) => {
                return CombinerResult::failure(
                    "",
                    0,
                    vec![format!("Combination failed: {error}")],
                );
            }
        };
        if objects.is_empty() {
            return CombinerResult::failure(
                "",
                0,
                vec!["No coverage files found in the specified S3 location".to_string()],
            );
        }

        let (downloaded, mut rejected) = self.download(&request.bucket, &objects, scratch, created);
        let (valid, integrity_rejected) = self.validate(downloaded);
        rejected.extend(integrity_rejected);

        if valid.is_empty() {
            let mut errors = vec!["No valid coverage files found after validation".to_string()];
            errors.extend(rejection_details(&rejected));
            return CombinerResult::failure("", rejected.len(), errors);
        }

        let merged_key = request
            .output_key
            .clone()
            .unwrap_or_else(|| combined_report_key(&request.prefix, Utc::now()));
        let merged_path = scratch.join("combined-coverage.json");
        created.push(merged_path.clone());

        let outcome = self
            .merge(&valid, rejected.len(), &merged_path)
            .and_then(|(_, stats)| {
                self.upload(&merged_path, &request.bucket, &merged_key, &stats)?;
                Ok(stats)
            });

        match outcome {
            Ok(stats) => {
                let valid_infos: Vec<DownloadedFileInfo> =
                    valid.iter().map(|file| file.info.clone()).collect();
                CombinerResult {
                    succeeded: true,
                    merged_key,
                    files_merged_count: stats.files_processed,
                    files_rejected_count: rejected.len(),
                    merged_coverage_percentage: stats.total_coverage_percentage,
                    errors: rejection_details(&rejected),
                    merge_report: Some(create_merge_report(&stats, &valid_infos, &rejected)),
                }
            }
            Err(error) => CombinerResult::failure(
                merged_key,
                rejected.len(),
                vec![format!("Combination failed: {error}")],
            ),
        }
    }
}

fn rejection_details(rejected: &[RejectedFile]) -> Vec<String> {
    let mut details: Vec<String> = rejected
        .iter()
        .take(MAX_ERROR_DETAILS)
        .map(RejectedFile::detail)
        .collect();
    if rejected.len() > MAX_ERROR_DETAILS {
        details.push(format!(
            "{} additional rejected file(s) not shown",
            rejected.len() - MAX_ERROR_DETAILS
        ));
    }
    details
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CombinerResponse {
    #[serde(flatten)]
    pub result: CombinerResult,
    pub lambda_request_id: String,
    pub lambda_function_name: String,
    pub processing_timestamp: String,
}

/// Lambda entry point. Malformed events produce a failed result rather than
/// an error so the caller always receives a structured response.
pub fn coverage_combiner_handler(
    event: &Value,
    context: &dyn InvocationContext,
    combiner: &Combiner,
) -> CombinerResponse {
    let result = match CombineRequest::from_event(event) {
        Ok(request) => combiner.combine(&request),
        Err(error) => {
            tracing::error!(error = %error, "coverage combiner handler failed");
            CombinerResult::failure("", 0, vec![format!("Handler error: {error}")])
        }
    };

    if !result.succeeded {
        tracing::error!(errors = ?result.errors, "coverage combination failed");
    }

    CombinerResponse {
        result,
        lambda_request_id: context
            .request_id()
            .unwrap_or_else(|| UNKNOWN_COMPONENT.to_string()),
        lambda_function_name: context
            .function_name()
            .unwrap_or_else(|| UNKNOWN_COMPONENT.to_string()),
        processing_timestamp: Utc::now().to_rfc3339(),
    }
}
