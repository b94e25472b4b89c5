#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lambda_coverage_layer::adapters::object_store::{
    ObjectPage, ObjectStore, ObjectSummary, PutRequest, StoreError, StoreErrorKind,
};
use lambda_coverage_layer::runtime::upload::Sleeper;

#[derive(Clone, Debug)]
pub struct StoredPut {
    pub bucket: String,
    pub key: String,
    pub body: Vec<u8>,
    pub metadata: BTreeMap<String, String>,
    pub content_type: String,
}

#[derive(Clone, Debug)]
struct SeededObject {
    body: Vec<u8>,
    last_modified: Option<DateTime<Utc>>,
}

/// In-memory bucket. Puts are recorded in order; listing pages through
/// seeded and uploaded objects `page_size` at a time.
pub struct RecordingStore {
    puts: Mutex<Vec<StoredPut>>,
    objects: Mutex<BTreeMap<String, SeededObject>>,
    page_size: usize,
}

impl Default for RecordingStore {
    fn default() -> Self {
        Self::with_page_size(1_000)
    }
}

impl RecordingStore {
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            puts: Mutex::new(Vec::new()),
            objects: Mutex::new(BTreeMap::new()),
            page_size,
        }
    }

    pub fn seed(&self, key: &str, body: Vec<u8>) {
        self.objects.lock().expect("poisoned mutex").insert(
            key.to_string(),
            SeededObject {
                body,
                last_modified: Some(Utc::now()),
            },
        );
    }

    pub fn puts(&self) -> Vec<StoredPut> {
        self.puts.lock().expect("poisoned mutex").clone()
    }
}

impl ObjectStore for RecordingStore {
    fn put_file(&self, request: &PutRequest<'_>) -> Result<(), StoreError> {
        let body = fs::read(request.source)
            .map_err(|error| StoreError::new(StoreErrorKind::LocalIo, error.to_string()))?;
        self.objects.lock().expect("poisoned mutex").insert(
            request.key.to_string(),
            SeededObject {
                body: body.clone(),
                last_modified: Some(Utc::now()),
            },
        );
        self.puts.lock().expect("poisoned mutex").push(StoredPut {
            bucket: request.bucket.to_string(),
            key: request.key.to_string(),
            body,
            metadata: request.metadata.clone(),
            content_type: request.content_type.to_string(),
        });
        Ok(())
    }

    fn list_objects(
        &self,
        _bucket: &str,
        prefix: &str,
        continuation: Option<&str>,
    ) -> Result<ObjectPage, StoreError> {
        let objects = self.objects.lock().expect("poisoned mutex");
        let start: usize = continuation.map_or(0, |token| token.parse().unwrap_or(0));
        let matching: Vec<ObjectSummary> = objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| ObjectSummary {
                key: key.clone(),
                size: object.body.len() as u64,
                last_modified: object.last_modified,
            })
            .collect();

        let end = (start + self.page_size).min(matching.len());
        Ok(ObjectPage {
            objects: matching[start.min(end)..end].to_vec(),
            next_token: (end < matching.len()).then(|| end.to_string()),
        })
    }

    fn get_object_to_file(
        &self,
        _bucket: &str,
        key: &str,
        destination: &Path,
    ) -> Result<u64, StoreError> {
        let objects = self.objects.lock().expect("poisoned mutex");
        let Some(object) = objects.get(key) else {
            return Err(StoreError::new(StoreErrorKind::NotFound, format!("no such key {key}")));
        };
        fs::write(destination, &object.body)
            .map_err(|error| StoreError::new(StoreErrorKind::LocalIo, error.to_string()))?;
        Ok(object.body.len() as u64)
    }
}

/// Store whose puts fail with `kind` for the first `failures` attempts
/// and then succeed.
pub struct FlakyStore {
    pub kind: StoreErrorKind,
    pub failures: u32,
    attempts: AtomicU32,
    inner: RecordingStore,
}

impl FlakyStore {
    pub fn new(kind: StoreErrorKind, failures: u32) -> Self {
        Self {
            kind,
            failures,
            attempts: AtomicU32::new(0),
            inner: RecordingStore::default(),
        }
    }

    pub fn always(kind: StoreErrorKind) -> Self {
        Self::new(kind, u32::MAX)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn puts(&self) -> Vec<StoredPut> {
        self.inner.puts()
    }
}

impl ObjectStore for FlakyStore {
    fn put_file(&self, request: &PutRequest<'_>) -> Result<(), StoreError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures {
            return Err(StoreError::new(self.kind, format!("scripted failure {attempt}")));
        }
        self.inner.put_file(request)
    }

    fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<&str>,
    ) -> Result<ObjectPage, StoreError> {
        self.inner.list_objects(bucket, prefix, continuation)
    }

    fn get_object_to_file(
        &self,
        bucket: &str,
        key: &str,
        destination: &Path,
    ) -> Result<u64, StoreError> {
        self.inner.get_object_to_file(bucket, key, destination)
    }
}

/// Records requested delays. An advancing sleeper also waits them out so
/// wall-clock deadlines move between attempts.
#[derive(Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
    advance_clock: bool,
}

impl RecordingSleeper {
    pub fn advancing() -> Self {
        Self {
            delays: Mutex::new(Vec::new()),
            advance_clock: true,
        }
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().expect("poisoned mutex").clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, delay: Duration) {
        self.delays.lock().expect("poisoned mutex").push(delay);
        if self.advance_clock {
            std::thread::sleep(delay);
        }
    }
}
