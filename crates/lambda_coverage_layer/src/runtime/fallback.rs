use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use lambda_coverage_core::error::{CoverageError, CoverageResult};
use lambda_coverage_core::storage_keys::report_file_name;
use serde::{Deserialize, Serialize};

use crate::runtime::short_id;

pub const FALLBACK_DIR_VAR: &str = "COVERAGE_FALLBACK_DIR";
pub const DEFAULT_RETENTION_HOURS: f64 = 24.0;
const SIDECAR_SUFFIX: &str = ".metadata";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackMetadata {
    pub reason: String,
    #[serde(default)]
    pub original_metadata: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl FallbackMetadata {
    pub fn new(reason: impl Into<String>, original_metadata: BTreeMap<String, String>) -> Self {
        Self {
            reason: reason.into(),
            original_metadata,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackRecord {
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub metadata: Option<FallbackMetadata>,
}

/// Local-disk home for reports that could not be uploaded.
#[derive(Debug, Clone)]
pub struct FallbackStore {
    root: PathBuf,
}

impl FallbackStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `COVERAGE_FALLBACK_DIR`, else `<tmp>/coverage_fallback`.
    pub fn from_env() -> Self {
        let root = std::env::var_os(FALLBACK_DIR_VAR)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("coverage_fallback"));
        Self::new(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_root(&self) -> CoverageResult<()> {
        fs::create_dir_all(&self.root).map_err(|error| {
            tracing::error!(
                root = %self.root.display(),
                error = %error,
                "cannot create fallback storage directory"
            );
            CoverageError::critical_io(&self.root, error)
        })
    }

    pub fn store(
        &self,
        source: &Path,
        function_name: &str,
        metadata: Option<&FallbackMetadata>,
    ) -> CoverageResult<PathBuf> {
        self.ensure_root()?;

        let destination = self
            .root
            .join(report_file_name(function_name, &short_id()));
        let size = fs::copy(source, &destination)
            .map_err(|error| CoverageError::io(source, error))?;

        if let Some(metadata) = metadata {
            let sidecar = sidecar_path(&destination);
            let body = serde_json::to_vec_pretty(metadata)?;
            fs::write(&sidecar, body).map_err(|error| CoverageError::io(&sidecar, error))?;
        }

        tracing::info!(
            path = %destination.display(),
            file_size_bytes = size,
            function_name,
            "coverage report stored in fallback storage"
        );
        Ok(destination)
    }

    pub fn list(&self) -> CoverageResult<Vec<FallbackRecord>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let entries =
            fs::read_dir(&self.root).map_err(|error| CoverageError::io(&self.root, error))?;
        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !is_report_file(&path) {
                continue;
            }
            let Ok(file_metadata) = entry.metadata() else {
                continue;
            };

            records.push(FallbackRecord {
                metadata: read_sidecar(&sidecar_path(&path)),
                size: file_metadata.len(),
                modified: file_metadata.modified().ok().map(DateTime::<Utc>::from),
                path,
            });
        }
        records.sort_by(|left, right| left.path.cmp(&right.path));
        Ok(records)
    }

    /// Deletes reports (and their sidecars) last modified more than
    /// `max_age_hours` ago. Returns how many reports were removed.
    pub fn evict(&self, max_age_hours: f64) -> CoverageResult<usize> {
        if !self.root.exists() {
            return Ok(0);
        }

        let max_age = Duration::from_secs_f64(max_age_hours.max(0.0) * 3_600.0);
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let entries =
            fs::read_dir(&self.root).map_err(|error| CoverageError::io(&self.root, error))?;
        let mut removed = 0usize;
        for entry in entries.flatten() {
            let path = entry.path();
            if !is_report_file(&path) {
                continue;
            }
            let modified = match entry.metadata().and_then(|metadata| metadata.modified()) {
                Ok(modified) => modified,
                Err(error) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %error,
                        "cannot stat fallback file"
                    );
                    continue;
                }
            };
            if modified >= cutoff {
                continue;
            }

            if let Err(error) = fs::remove_file(&path) {
                tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "failed to evict fallback file"
                );
                continue;
            }
            let sidecar = sidecar_path(&path);
            if sidecar.exists() {
                if let Err(error) = fs::remove_file(&sidecar) {
                    tracing::warn!(
                        path = %sidecar.display(),
                        error = %error,
                        "failed to evict fallback sidecar"
                    );
                }
            }
            removed += 1;
        }

        if removed > 0 {
            tracing::info!(removed, max_age_hours, "evicted expired fallback reports");
        }
        Ok(removed)
    }
}

fn sidecar_path(report: &Path) -> PathBuf {
    let mut name = report.as_os_str().to_owned();
    name.push(SIDECAR_SUFFIX);
    PathBuf::from(name)
}

fn is_report_file(path: &Path) -> bool {
    path.is_file() && path.extension().is_some_and(|ext| ext == "json")
}

fn read_sidecar(path: &Path) -> Option<FallbackMetadata> {
    let bytes = fs::read(path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(metadata) => Some(metadata),
        Err(error) => {
            tracing::warn!(
                path = %path.display(),
                error = %error,
                "ignoring malformed fallback metadata"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source_report(dir: &Path) -> PathBuf {
        let path = dir.join("report.json");
        fs::write(&path, br#"{"files": {}, "totals": {}}"#).unwrap();
        path
    }

    #[test]
    fn stores_copy_with_sidecar_and_lists_it() {
        let scratch = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let store = FallbackStore::new(root.path().join("fallback"));
        let metadata = FallbackMetadata::new(
            "upload_failed",
            BTreeMap::from([("function-name".to_string(), "orders".to_string())]),
        );

        let stored = store
            .store(&source_report(scratch.path()), "orders", Some(&metadata))
            .unwrap();

        assert!(stored.exists());
        assert!(sidecar_path(&stored).exists());
        let records = store.list().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, stored);
        assert_eq!(records[0].metadata.as_ref(), Some(&metadata));
    }

    #[test]
    fn malformed_sidecar_is_treated_as_absent() {
        let scratch = tempfile::tempdir().unwrap();
        let store = FallbackStore::new(scratch.path().join("fallback"));
        let stored = store
            .store(&source_report(scratch.path()), "fn", None)
            .unwrap();
        fs::write(sidecar_path(&stored), b"{not json").unwrap();

        let records = store.list().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].metadata, None);
    }

    #[test]
    fn evicts_only_expired_reports() {
        let scratch = tempfile::tempdir().unwrap();
        let store = FallbackStore::new(scratch.path().join("fallback"));
        let metadata = FallbackMetadata::new("upload_failed", BTreeMap::new());
        let old = store
            .store(&source_report(scratch.path()), "old", Some(&metadata))
            .unwrap();
        let fresh = store
            .store(&source_report(scratch.path()), "fresh", None)
            .unwrap();

        let two_days_ago = SystemTime::now() - Duration::from_secs(48 * 3_600);
        fs::File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(two_days_ago)
            .unwrap();

        assert_eq!(store.evict(DEFAULT_RETENTION_HOURS).unwrap(), 1);
        assert!(!old.exists());
        assert!(!sidecar_path(&old).exists());
        assert!(fresh.exists());
    }

    #[test]
    fn unwritable_root_is_critical() {
        let scratch = tempfile::tempdir().unwrap();
        let blocker = scratch.path().join("occupied");
        fs::write(&blocker, b"file, not a directory").unwrap();
        let store = FallbackStore::new(blocker.join("fallback"));

        let error = store
            .store(&source_report(scratch.path()), "fn", None)
            .expect_err("root cannot be created under a file");
        assert!(error.is_critical());
    }

    #[test]
    fn missing_root_lists_nothing() {
        let scratch = tempfile::tempdir().unwrap();
        let store = FallbackStore::new(scratch.path().join("never-created"));
        assert!(store.list().unwrap().is_empty());
        assert_eq!(store.evict(1.0).unwrap(), 0);
    }
}
