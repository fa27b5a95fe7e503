//! Blob storage for delivered snapshots, the archive and the error bucket.
//!
//! The trait has a production implementation on S3 and an in-memory one that is
//! always compiled, so downstream crates can drive the pipeline without
//! network access.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

mod s3;

pub use s3::S3BlobStore;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlobError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("blob operation failed: {0}")]
    OperationFailed(String),
}

/// A single object in a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobLocation {
    pub bucket: String,
    pub name: String,
}

impl BlobLocation {
    pub fn new(bucket: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            name: name.into(),
        }
    }

    /// The same object name in another bucket.
    pub fn in_bucket(&self, bucket: &str) -> Self {
        Self::new(bucket, self.name.clone())
    }
}

impl fmt::Display for BlobLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMeta {
    pub name: String,
    pub last_modified: DateTime<Utc>,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn read(&self, location: &BlobLocation) -> Result<Vec<u8>, BlobError>;

    async fn write(
        &self,
        location: &BlobLocation,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), BlobError>;

    async fn delete(&self, location: &BlobLocation) -> Result<(), BlobError>;

    /// Every object in `bucket` whose name starts with `prefix`.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<BlobMeta>, BlobError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlobOp {
    Read,
    Write,
    Delete,
    List,
}

#[derive(Debug, Clone)]
struct StoredBlob {
    bytes: Vec<u8>,
    content_type: String,
    last_modified: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryState {
    objects: BTreeMap<(String, String), StoredBlob>,
    ticks: i64,
}

impl MemoryState {
    /// Every write is one second later than the previous one, so listings
    /// order deterministically.
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        self.ticks += 1;
        DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(1_600_000_000 + self.ticks)
    }
}

/// In-memory blob store for tests and local runs.
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    state: Arc<Mutex<MemoryState>>,
    failing: Arc<Mutex<HashSet<BlobOp>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Make every subsequent call of `op` fail.
    pub fn fail_on(self, op: BlobOp) -> Self {
        match self.failing.lock() {
            Ok(mut failing) => failing.insert(op),
            Err(poisoned) => poisoned.into_inner().insert(op),
        };
        self
    }

    fn check(&self, op: BlobOp) -> Result<(), BlobError> {
        let failing = match self.failing.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if failing.contains(&op) {
            return Err(BlobError::OperationFailed(format!("injected {op:?} failure")));
        }
        Ok(())
    }

    pub fn put(&self, bucket: &str, name: &str, bytes: impl Into<Vec<u8>>) {
        let mut state = self.lock();
        let last_modified = state.next_timestamp();
        state.objects.insert(
            (bucket.to_owned(), name.to_owned()),
            StoredBlob {
                bytes: bytes.into(),
                content_type: "application/octet-stream".to_owned(),
                last_modified,
            },
        );
    }

    /// Store an object with an explicit modification time.
    pub fn put_at(
        &self,
        bucket: &str,
        name: &str,
        bytes: impl Into<Vec<u8>>,
        last_modified: DateTime<Utc>,
    ) {
        self.lock().objects.insert(
            (bucket.to_owned(), name.to_owned()),
            StoredBlob {
                bytes: bytes.into(),
                content_type: "application/octet-stream".to_owned(),
                last_modified,
            },
        );
    }

    pub fn get(&self, bucket: &str, name: &str) -> Option<Vec<u8>> {
        self.lock()
            .objects
            .get(&(bucket.to_owned(), name.to_owned()))
            .map(|blob| blob.bytes.clone())
    }

    pub fn content_type(&self, bucket: &str, name: &str) -> Option<String> {
        self.lock()
            .objects
            .get(&(bucket.to_owned(), name.to_owned()))
            .map(|blob| blob.content_type.clone())
    }

    pub fn names(&self, bucket: &str) -> Vec<String> {
        self.lock()
            .objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, name)| name.clone())
            .collect()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn read(&self, location: &BlobLocation) -> Result<Vec<u8>, BlobError> {
        self.check(BlobOp::Read)?;
        self.get(&location.bucket, &location.name)
            .ok_or_else(|| BlobError::NotFound(location.to_string()))
    }

    async fn write(
        &self,
        location: &BlobLocation,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), BlobError> {
        self.check(BlobOp::Write)?;
        let mut state = self.lock();
        let last_modified = state.next_timestamp();
        state.objects.insert(
            (location.bucket.clone(), location.name.clone()),
            StoredBlob {
                bytes,
                content_type: content_type.to_owned(),
                last_modified,
            },
        );
        Ok(())
    }

    async fn delete(&self, location: &BlobLocation) -> Result<(), BlobError> {
        self.check(BlobOp::Delete)?;
        self.lock()
            .objects
            .remove(&(location.bucket.clone(), location.name.clone()));
        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<BlobMeta>, BlobError> {
        self.check(BlobOp::List)?;
        Ok(self
            .lock()
            .objects
            .iter()
            .filter(|((b, name), _)| b == bucket && name.starts_with(prefix))
            .map(|((_, name), blob)| BlobMeta {
                name: name.clone(),
                last_modified: blob.last_modified,
            })
            .collect())
    }
}
