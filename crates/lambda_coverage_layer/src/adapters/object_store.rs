use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};

/// Closed set of storage failure classes. Backends map their own error
/// codes onto these; retry policy only ever looks at the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    BucketNotFound,
    AccessDenied,
    InvalidBucketName,
    NotFound,
    Throttled,
    Transport,
    Service,
    /// The local side of a transfer failed (unreadable source, unwritable
    /// destination).
    LocalIo,
}

impl StoreErrorKind {
    pub fn is_retryable(self) -> bool {
        !matches!(
            self,
            Self::BucketNotFound | Self::AccessDenied | Self::InvalidBucketName | Self::LocalIo
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::BucketNotFound => "bucket_not_found",
            Self::AccessDenied => "access_denied",
            Self::InvalidBucketName => "invalid_bucket_name",
            Self::NotFound => "not_found",
            Self::Throttled => "throttled",
            Self::Transport => "transport",
            Self::Service => "service",
            Self::LocalIo => "local_io",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub message: String,
}

impl StoreError {
    pub fn new(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.kind.as_str())
    }
}

impl std::error::Error for StoreError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectPage {
    pub objects: Vec<ObjectSummary>,
    pub next_token: Option<String>,
}

pub struct PutRequest<'a> {
    pub bucket: &'a str,
    pub key: &'a str,
    pub source: &'a Path,
    pub metadata: &'a BTreeMap<String, String>,
    pub content_type: &'a str,
}

/// Blocking object-store operations used by the upload engine and the
/// combiner.
pub trait ObjectStore: Send + Sync {
    fn put_file(&self, request: &PutRequest<'_>) -> Result<(), StoreError>;

    fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<&str>,
    ) -> Result<ObjectPage, StoreError>;

    fn get_object_to_file(&self, bucket: &str, key: &str, destination: &Path)
        -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_permission_and_local_failures_are_terminal() {
        let terminal = [
            StoreErrorKind::BucketNotFound,
            StoreErrorKind::AccessDenied,
            StoreErrorKind::InvalidBucketName,
            StoreErrorKind::LocalIo,
        ];
        for kind in terminal {
            assert!(!kind.is_retryable(), "{kind:?}");
        }
        for kind in [
            StoreErrorKind::NotFound,
            StoreErrorKind::Throttled,
            StoreErrorKind::Transport,
            StoreErrorKind::Service,
        ] {
            assert!(kind.is_retryable(), "{kind:?}");
        }
    }

    #[test]
    fn display_carries_kind_label() {
        let error = StoreError::new(StoreErrorKind::AccessDenied, "put rejected");
        assert_eq!(error.to_string(), "put rejected (access_denied)");
    }
}
