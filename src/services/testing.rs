//! Fault-injecting store wrappers shared by the service and handler tests.

use crate::{
    models::image::{ImagePatch, ImageRecord},
    services::{
        blob_store::{AccessHandle, BlobError, BlobResult, BlobStore, LocalBlobStore},
        metadata_index::{IndexResult, MetadataIndex, SqliteMetadataIndex, tests::memory_index},
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    io,
    path::Path,
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};
use uuid::Uuid;

fn injected() -> BlobError {
    BlobError::Io(io::Error::other("injected blob failure"))
}

/// Local blob store whose operations can be made to fail or stall.
pub struct FlakyBlobs {
    pub inner: LocalBlobStore,
    pub fail_put: AtomicBool,
    pub fail_delete: AtomicBool,
    pub fail_handle: AtomicBool,
    pub put_delay_ms: AtomicU64,
    pub puts: AtomicUsize,
    pub deletes: AtomicUsize,
}

impl FlakyBlobs {
    pub fn new(dir: &Path) -> Self {
        Self {
            inner: LocalBlobStore::new(dir, "http://img.test", b"test-secret".to_vec()),
            fail_put: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
            fail_handle: AtomicBool::new(false),
            put_delay_ms: AtomicU64::new(0),
            puts: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl BlobStore for FlakyBlobs {
    async fn put(&self, owner: &str, id: Uuid, filename: &str, bytes: Bytes) -> BlobResult<String> {
        let delay = self.put_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.puts.fetch_add(1, Ordering::SeqCst);
        if self.fail_put.load(Ordering::SeqCst) {
            return Err(injected());
        }
        self.inner.put(owner, id, filename, bytes).await
    }

    async fn get(&self, key: &str) -> BlobResult<Bytes> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(injected());
        }
        self.inner.delete(key).await
    }

    async fn access_handle(&self, key: &str, ttl: Duration) -> BlobResult<AccessHandle> {
        if self.fail_handle.load(Ordering::SeqCst) {
            return Err(injected());
        }
        self.inner.access_handle(key, ttl).await
    }

    fn verify_handle(&self, key: &str, expires: i64, signature: &str) -> BlobResult<()> {
        self.inner.verify_handle(key, expires, signature)
    }

    async fn probe(&self) -> BlobResult<()> {
        self.inner.probe().await
    }
}

/// In-memory SQLite index whose record writes can be made to fail or stall.
pub struct FlakyIndex {
    pub inner: SqliteMetadataIndex,
    pub fail_create: AtomicBool,
    /// Stalls a record write before it commits.
    pub create_delay_ms: AtomicU64,
    pub fail_delete: AtomicBool,
    pub deletes: AtomicUsize,
}

impl FlakyIndex {
    pub async fn new() -> Self {
        Self {
            inner: memory_index().await,
            fail_create: AtomicBool::new(false),
            create_delay_ms: AtomicU64::new(0),
            fail_delete: AtomicBool::new(false),
            deletes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl MetadataIndex for FlakyIndex {
    async fn create(&self, record: &ImageRecord) -> IndexResult<()> {
        let delay = self.create_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(sqlx::Error::PoolTimedOut.into());
        }
        self.inner.create(record).await
    }

    async fn get(&self, id: Uuid, owner: &str) -> IndexResult<ImageRecord> {
        self.inner.get(id, owner).await
    }

    async fn update(&self, id: Uuid, owner: &str, patch: &ImagePatch) -> IndexResult<ImageRecord> {
        self.inner.update(id, owner, patch).await
    }

    async fn delete(&self, id: Uuid, owner: &str) -> IndexResult<ImageRecord> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(sqlx::Error::PoolTimedOut.into());
        }
        self.inner.delete(id, owner).await
    }

    async fn list_by_owner(&self, owner: &str, limit: usize) -> IndexResult<Vec<ImageRecord>> {
        self.inner.list_by_owner(owner, limit).await
    }

    async fn list_by_title(&self, title: &str, limit: usize) -> IndexResult<Vec<ImageRecord>> {
        self.inner.list_by_title(title, limit).await
    }

    async fn list_by_tags(
        &self,
        owner: &str,
        tags: &[String],
        limit: usize,
    ) -> IndexResult<Vec<ImageRecord>> {
        self.inner.list_by_tags(owner, tags, limit).await
    }

    async fn ping(&self) -> IndexResult<()> {
        self.inner.ping().await
    }
}

/// Number of regular files anywhere below `dir`.
pub fn count_files(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                count_files(&path)
            } else {
                1
            }
        })
        .sum()
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// Split an access handle URL into `(key, expires, sig)`.
pub fn handle_parts(url: &str) -> (String, i64, String) {
    let rest = url.split("/blobs/").nth(1).unwrap();
    let (key, query) = rest.split_once('?').unwrap();
    let mut expires = 0;
    let mut sig = String::new();
    for pair in query.split('&') {
        match pair.split_once('=') {
            Some(("expires", v)) => expires = v.parse().unwrap(),
            Some(("sig", v)) => sig = v.to_string(),
            _ => {}
        }
    }
    (key.to_string(), expires, sig)
}
