//! Shared fixtures for engine tests: in-memory SQLite, a temp storage root
//! and two buckets, `alice` and `bob`.

use crate::{
    db::memory_pool,
    models::bucket::Bucket,
    services::{
        blob_store::{BlobError, BlobResult, BlobStore, LocalBlobStore},
        dedup_engine::DedupStorageEngine,
        metadata_index::SqliteMetadataIndex,
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use sqlx::SqlitePool;
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tempfile::TempDir;
use uuid::Uuid;

pub(crate) struct TestEnv {
    pub engine: DedupStorageEngine,
    pub blobs: Arc<LocalBlobStore>,
    pub index: Arc<SqliteMetadataIndex>,
    pub db: Arc<SqlitePool>,
    pub dir: TempDir,
}

pub(crate) async fn env() -> TestEnv {
    let dir = tempfile::tempdir().unwrap();
    let db = memory_pool().await;
    let storage_dir = dir.path().join("objects");
    std::fs::create_dir_all(&storage_dir).unwrap();
    let blobs = Arc::new(LocalBlobStore::new(db.clone(), storage_dir));
    let index = Arc::new(SqliteMetadataIndex::new(db.clone()));
    let engine = DedupStorageEngine::new(blobs.clone(), index.clone(), "files_index");
    engine.init().await.unwrap();
    blobs.create_bucket("alice").await.unwrap();
    blobs.create_bucket("bob").await.unwrap();

    TestEnv {
        engine,
        blobs,
        index,
        db,
        dir,
    }
}

impl TestEnv {
    /// Write `body` to a fresh staging directory as `name`.
    pub async fn stage(&self, name: &str, body: &[u8]) -> PathBuf {
        let staging = self.dir.path().join(format!("staging-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&staging).await.unwrap();
        let path = staging.join(name);
        tokio::fs::write(&path, body).await.unwrap();
        path
    }

    /// An engine over the same catalog whose blob store is `blobs`.
    pub fn engine_with(&self, blobs: FaultyBlobStore) -> DedupStorageEngine {
        DedupStorageEngine::new(Arc::new(blobs), self.index.clone(), self.engine.index_name())
    }

    pub fn storage_dir(&self) -> PathBuf {
        self.dir.path().join("objects")
    }

    /// Number of payload files physically stored.
    pub async fn payload_files(&self) -> usize {
        count_files(&self.storage_dir())
    }
}

fn count_files(dir: &Path) -> usize {
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

/// `BlobStore` over a `LocalBlobStore` with injectable faults.
pub(crate) struct FaultyBlobStore {
    pub inner: Arc<LocalBlobStore>,
    /// `put_body` fails with an I/O error.
    pub fail_put_body: bool,
    /// Names `list` reports although no such object exists.
    pub phantom_names: Vec<String>,
}

impl FaultyBlobStore {
    pub fn new(inner: Arc<LocalBlobStore>) -> Self {
        Self {
            inner,
            fail_put_body: false,
            phantom_names: Vec::new(),
        }
    }
}

#[async_trait]
impl BlobStore for FaultyBlobStore {
    async fn create_bucket(&self, bucket: &str) -> BlobResult<Bucket> {
        self.inner.create_bucket(bucket).await
    }

    async fn bucket_exists(&self, bucket: &str) -> BlobResult<bool> {
        self.inner.bucket_exists(bucket).await
    }

    async fn exists(&self, bucket: &str, name: &str) -> BlobResult<bool> {
        self.inner.exists(bucket, name).await
    }

    async fn put(&self, bucket: &str, name: &str, source: &Path) -> BlobResult<String> {
        self.inner.put(bucket, name, source).await
    }

    async fn get(&self, bucket: &str, name: &str) -> BlobResult<Bytes> {
        self.inner.get(bucket, name).await
    }

    async fn get_body(&self, object_key: &str) -> BlobResult<Bytes> {
        self.inner.get_body(object_key).await
    }

    async fn put_body(&self, object_key: &str, body: Bytes) -> BlobResult<()> {
        if self.fail_put_body {
            return Err(BlobError::Io(io::Error::other("disk full")));
        }
        self.inner.put_body(object_key, body).await
    }

    async fn delete(&self, bucket: &str, name: &str) -> BlobResult<()> {
        self.inner.delete(bucket, name).await
    }

    async fn create_link(
        &self,
        bucket: &str,
        target_object_key: &str,
        link_name: &str,
    ) -> BlobResult<String> {
        self.inner
            .create_link(bucket, target_object_key, link_name)
            .await
    }

    async fn repoint_link(&self, object_key: &str, target_object_key: &str) -> BlobResult<()> {
        self.inner.repoint_link(object_key, target_object_key).await
    }

    async fn resolve_link(&self, bucket: &str, name: &str) -> BlobResult<Option<String>> {
        self.inner.resolve_link(bucket, name).await
    }

    async fn list(&self, bucket: &str, prefix: Option<&str>) -> BlobResult<Vec<String>> {
        let mut names = self.inner.list(bucket, prefix).await?;
        names.extend(self.phantom_names.iter().cloned());
        names.sort();
        Ok(names)
    }

    async fn size(&self, bucket: &str, name: &str) -> BlobResult<i64> {
        self.inner.size(bucket, name).await
    }
}
