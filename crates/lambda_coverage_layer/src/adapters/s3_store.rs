use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::path::Path;

use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ServerSideEncryption;
use chrono::DateTime;
use tokio::runtime::Handle;

use crate::adapters::object_store::{
    ObjectPage, ObjectStore, ObjectSummary, PutRequest, StoreError, StoreErrorKind,
};

/// S3-backed [`ObjectStore`]. Calls block the current thread on the
/// runtime handle captured at construction, so the store can also be used
/// from detached upload threads.
#[derive(Clone)]
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    handle: Handle,
}

impl S3ObjectStore {
    pub fn new(client: aws_sdk_s3::Client, handle: Handle) -> Self {
        Self { client, handle }
    }

    /// Loads the default AWS configuration chain. Must be awaited inside a
    /// multi-threaded tokio runtime.
    pub async fn from_env() -> Self {
        let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(aws_sdk_s3::Client::new(&aws_config), Handle::current())
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        match Handle::try_current() {
            Ok(_) => tokio::task::block_in_place(|| self.handle.block_on(future)),
            Err(_) => self.handle.block_on(future),
        }
    }
}

impl ObjectStore for S3ObjectStore {
    fn put_file(&self, request: &PutRequest<'_>) -> Result<(), StoreError> {
        let body = read_source(request.source)?;
        let metadata: HashMap<String, String> = request
            .metadata
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        let client = self.client.clone();
        let bucket = request.bucket.to_string();
        let key = request.key.to_string();
        let content_type = request.content_type.to_string();

        self.block_on(async move {
            client
                .put_object()
                .bucket(bucket)
                .key(key)
                .body(ByteStream::from(body))
                .content_type(content_type)
                .server_side_encryption(ServerSideEncryption::Aes256)
                .set_metadata(Some(metadata))
                .send()
                .await
                .map(|_| ())
                .map_err(|error| store_error("failed to write object to s3", &error))
        })
    }

    fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<&str>,
    ) -> Result<ObjectPage, StoreError> {
        let client = self.client.clone();
        let bucket = bucket.to_string();
        let prefix = prefix.to_string();
        let continuation = continuation.map(str::to_string);

        self.block_on(async move {
            let output = client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .set_continuation_token(continuation)
                .send()
                .await
                .map_err(|error| store_error("failed to list objects in s3", &error))?;

            let objects = output
                .contents()
                .iter()
                .filter_map(|object| {
                    let key = object.key()?.to_string();
                    Some(ObjectSummary {
                        key,
                        size: object.size().unwrap_or_default().max(0) as u64,
                        last_modified: object.last_modified().and_then(|stamp| {
                            DateTime::from_timestamp(stamp.secs(), stamp.subsec_nanos())
                        }),
                    })
                })
                .collect();

            let next_token = if output.is_truncated().unwrap_or(false) {
                output.next_continuation_token().map(str::to_string)
            } else {
                None
            };

            Ok(ObjectPage {
                objects,
                next_token,
            })
        })
    }

    fn get_object_to_file(
        &self,
        bucket: &str,
        key: &str,
        destination: &Path,
    ) -> Result<u64, StoreError> {
        let client = self.client.clone();
        let bucket = bucket.to_string();
        let key = key.to_string();

        let bytes = self.block_on(async move {
            let output = client
                .get_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|error| store_error("failed to read object from s3", &error))?;
            output
                .body
                .collect()
                .await
                .map(|aggregated| aggregated.into_bytes())
                .map_err(|error| {
                    StoreError::new(
                        StoreErrorKind::Transport,
                        format!("failed to stream object body: {error}"),
                    )
                })
        })?;

        fs::write(destination, &bytes).map_err(|error| {
            StoreError::new(
                StoreErrorKind::LocalIo,
                format!("failed to write {}: {error}", destination.display()),
            )
        })?;
        Ok(bytes.len() as u64)
    }
}

fn read_source(path: &Path) -> Result<Vec<u8>, StoreError> {
    fs::read(path).map_err(|error| {
        StoreError::new(
            StoreErrorKind::LocalIo,
            format!("failed to read {}: {error}", path.display()),
        )
    })
}

fn store_error<E, R>(context: &str, error: &SdkError<E, R>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let kind = match error {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => StoreErrorKind::Transport,
        _ => kind_for_code(error.code()),
    };
    StoreError::new(kind, format!("{context}: {}", DisplayErrorContext(error)))
}

fn kind_for_code(code: Option<&str>) -> StoreErrorKind {
    match code {
        Some("NoSuchBucket") => StoreErrorKind::BucketNotFound,
        Some("AccessDenied" | "Forbidden" | "AllAccessDisabled") => StoreErrorKind::AccessDenied,
        Some("InvalidBucketName") => StoreErrorKind::InvalidBucketName,
        Some("NoSuchKey" | "NotFound") => StoreErrorKind::NotFound,
        Some("SlowDown" | "Throttling" | "ThrottlingException" | "RequestTimeout") => {
            StoreErrorKind::Throttled
        }
        _ => StoreErrorKind::Service,
    }
}
