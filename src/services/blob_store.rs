//! src/services/blob_store.rs
//!
//! Bucket-scoped object storage. `BlobStore` is the capability the dedup
//! engine needs; `LocalBlobStore` implements it with SQLite for the object
//! catalog and local disk for payloads sharded beneath
//! `base_path/{bucket}/{shard}/{shard}/{name}`.
//!
//! Links are catalog rows with a `link_target` and no payload of their own.
//! Reading a link serves the target's bytes.

use crate::{
    models::{bucket::Bucket, object::BlobObject},
    services::naming::{object_key, split_object_key},
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt, pin_mut, stream};
use md5::Context;
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("bucket `{0}` already exists")]
    BucketAlreadyExists(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("object `{key}` already exists in bucket `{bucket}`")]
    ObjectAlreadyExists { bucket: String, key: String },
    #[error("invalid object key `{0}`")]
    InvalidObjectKey(String),
    #[error("object `{0}` is not a link")]
    NotALink(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl BlobError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BlobError::ObjectNotFound { .. } | BlobError::BucketNotFound(_)
        )
    }
}

pub type BlobResult<T> = Result<T, BlobError>;

/// Object storage operations the dedup engine relies on.
///
/// Object keys are `bucket/name`.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn create_bucket(&self, bucket: &str) -> BlobResult<Bucket>;

    async fn bucket_exists(&self, bucket: &str) -> BlobResult<bool>;

    async fn exists(&self, bucket: &str, name: &str) -> BlobResult<bool>;

    /// Upload the local file at `source` as a new object `bucket/name`.
    /// Returns the object key, or `ObjectAlreadyExists` when the name is
    /// taken; the existing object is left untouched.
    async fn put(&self, bucket: &str, name: &str, source: &Path) -> BlobResult<String>;

    /// Bytes served by `bucket/name`, following a link to its target.
    async fn get(&self, bucket: &str, name: &str) -> BlobResult<Bytes>;

    async fn get_body(&self, object_key: &str) -> BlobResult<Bytes>;

    /// Overwrite the payload of `object_key`. A link written this way stops
    /// being a link.
    async fn put_body(&self, object_key: &str, body: Bytes) -> BlobResult<()>;

    async fn delete(&self, bucket: &str, name: &str) -> BlobResult<()>;

    /// Create `bucket/link_name` serving the bytes of `target_object_key`
    /// without copying them. Returns the new object key.
    async fn create_link(
        &self,
        bucket: &str,
        target_object_key: &str,
        link_name: &str,
    ) -> BlobResult<String>;

    /// Point an existing link at a different target.
    async fn repoint_link(&self, object_key: &str, target_object_key: &str) -> BlobResult<()>;

    /// Target key of a link, `None` for a plain object.
    async fn resolve_link(&self, bucket: &str, name: &str) -> BlobResult<Option<String>>;

    /// Object names in `bucket`, lexicographically, optionally prefix-filtered.
    async fn list(&self, bucket: &str, prefix: Option<&str>) -> BlobResult<Vec<String>>;

    async fn size(&self, bucket: &str, name: &str) -> BlobResult<i64>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum WriteMode {
    CreateNew,
    Replace,
}

/// `BlobStore` over SQLite metadata and an on-disk payload tree.
#[derive(Clone)]
pub struct LocalBlobStore {
    /// Shared SQLite connection pool used for the object catalog.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,
}

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;

impl LocalBlobStore {
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
        }
    }

    /// Basic name validation to avoid trivial path traversal vectors.
    ///
    /// Rejects names that begin with `/` or contain `..`.
    fn ensure_key_safe(&self, key: &str) -> BlobResult<()> {
        let invalid = || BlobError::InvalidObjectKey(key.to_string());
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(invalid());
        }
        if key.starts_with('/') || key.contains("..") {
            return Err(invalid());
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(invalid());
        }
        Ok(())
    }

    /// Validate bucket name format.
    ///
    /// Enforces S3-like naming rules:
    /// - 3–63 characters
    /// - lowercase letters, digits, dots, hyphens only
    /// - cannot start/end with dot or hyphen
    /// - cannot contain consecutive dots or dot-hyphen patterns
    /// - cannot look like an IPv4 address
    fn ensure_bucket_name_safe(&self, name: &str) -> BlobResult<()> {
        let invalid = |reason: &str| BlobError::InvalidBucketName {
            name: name.to_string(),
            reason: reason.into(),
        };

        let len = name.len();
        if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
            return Err(invalid("must be between 3 and 63 characters"));
        }

        if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
        {
            return Err(invalid(
                "allowed characters are lowercase letters, digits, dots, and hyphens",
            ));
        }

        if name.starts_with('.')
            || name.ends_with('.')
            || name.starts_with('-')
            || name.ends_with('-')
        {
            return Err(invalid("must start and end with a lowercase letter or digit"));
        }

        if name.contains("..") || name.contains("-.") || name.contains(".-") {
            return Err(invalid(
                "cannot contain consecutive dots or dot-hyphen combinations",
            ));
        }

        if is_ipv4_like(name) {
            return Err(invalid("must not be formatted like an IP address"));
        }

        Ok(())
    }

    fn bucket_root(&self, bucket: &str) -> PathBuf {
        self.base_path.join(bucket)
    }

    /// Two-level shard directories for an object: the first two bytes of
    /// MD5(bucket/name) as lowercase hex.
    fn object_shards(bucket: &str, name: &str) -> (String, String) {
        let digest = md5::compute(object_key(bucket, name));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, bucket: &str, name: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(bucket, name);
        let mut path = self.bucket_root(bucket);
        path.push(shard_a);
        path.push(shard_b);
        path.push(name);
        path
    }

    fn parse_key<'a>(&self, key: &'a str) -> BlobResult<(&'a str, &'a str)> {
        split_object_key(key).ok_or_else(|| BlobError::InvalidObjectKey(key.to_string()))
    }

    async fn fetch_bucket(&self, bucket: &str) -> BlobResult<Bucket> {
        self.ensure_bucket_name_safe(bucket)?;
        sqlx::query_as::<Sqlite, Bucket>("SELECT name, created_at FROM blob_buckets WHERE name = ?")
            .bind(bucket)
            .fetch_optional(&*self.db)
            .await?
            .ok_or_else(|| BlobError::BucketNotFound(bucket.to_string()))
    }

    async fn fetch_object(&self, bucket: &str, name: &str) -> BlobResult<Option<BlobObject>> {
        let object = sqlx::query_as::<Sqlite, BlobObject>(
            "SELECT bucket, name, size_bytes, etag, link_target, last_modified
             FROM blob_objects WHERE bucket = ? AND name = ?",
        )
        .bind(bucket)
        .bind(name)
        .fetch_optional(&*self.db)
        .await?;
        Ok(object)
    }

    async fn require_object(&self, bucket: &str, name: &str) -> BlobResult<BlobObject> {
        self.fetch_object(bucket, name)
            .await?
            .ok_or_else(|| BlobError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: name.to_string(),
            })
    }

    /// Stream bytes into a temp file beside the payload path of
    /// `bucket/name`, fsynced. Returns the temp path, size and MD5 etag. The
    /// temp file is removed on failure.
    async fn stage_payload<S>(&self, file_path: &Path, stream: S) -> BlobResult<(PathBuf, i64, String)>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            BlobError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        match write_temp(&tmp_path, stream).await {
            Ok((size, etag)) => Ok((tmp_path, size, etag)),
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                Err(BlobError::Io(err))
            }
        }
    }

    /// Claim `bucket/name` for a new payload-owning object.
    async fn insert_object(&self, bucket: &str, name: &str, size: i64, etag: &str) -> BlobResult<()> {
        let inserted = sqlx::query(
            "INSERT INTO blob_objects (bucket, name, size_bytes, etag, link_target, last_modified)
             VALUES (?, ?, ?, ?, NULL, ?)",
        )
        .bind(bucket)
        .bind(name)
        .bind(size)
        .bind(etag)
        .bind(Utc::now())
        .execute(&*self.db)
        .await;

        match inserted {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(BlobError::ObjectAlreadyExists {
                bucket: bucket.to_string(),
                key: name.to_string(),
            }),
            Err(err) => Err(BlobError::Sqlx(err)),
        }
    }

    /// Insert or replace the catalog row of a payload-owning object.
    async fn upsert_object(&self, bucket: &str, name: &str, size: i64, etag: &str) -> BlobResult<()> {
        sqlx::query(
            r#"
            INSERT INTO blob_objects (bucket, name, size_bytes, etag, link_target, last_modified)
            VALUES (?, ?, ?, ?, NULL, ?)
            ON CONFLICT(bucket, name) DO UPDATE SET
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                link_target = NULL,
                last_modified = excluded.last_modified
            "#,
        )
        .bind(bucket)
        .bind(name)
        .bind(size)
        .bind(etag)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Write `stream` as the payload of `bucket/name`.
    ///
    /// `WriteMode::CreateNew` claims the catalog row before the payload is
    /// renamed into place, so an existing object is never touched.
    /// `WriteMode::Replace` overwrites payload and row.
    async fn store_stream<S>(
        &self,
        bucket: &str,
        name: &str,
        stream: S,
        mode: WriteMode,
    ) -> BlobResult<String>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        self.ensure_key_safe(name)?;
        self.fetch_bucket(bucket).await?;

        let file_path = self.object_path(bucket, name);
        let (tmp_path, size, etag) = self.stage_payload(&file_path, stream).await?;

        match mode {
            WriteMode::CreateNew => {
                if let Err(err) = self.insert_object(bucket, name, size, &etag).await {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(err);
                }
                if let Err(err) = fs::rename(&tmp_path, &file_path).await {
                    let _ = fs::remove_file(&tmp_path).await;
                    let _ = sqlx::query("DELETE FROM blob_objects WHERE bucket = ? AND name = ?")
                        .bind(bucket)
                        .bind(name)
                        .execute(&*self.db)
                        .await;
                    return Err(BlobError::Io(err));
                }
            }
            WriteMode::Replace => {
                if let Err(err) = fs::rename(&tmp_path, &file_path).await {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(BlobError::Io(err));
                }
                if let Err(err) = self.upsert_object(bucket, name, size, &etag).await {
                    let _ = fs::remove_file(&file_path).await;
                    return Err(err);
                }
            }
        }

        debug!(bucket, name, size, ?mode, "stored object payload");
        Ok(object_key(bucket, name))
    }

    async fn read_payload(&self, bucket: &str, name: &str) -> BlobResult<Bytes> {
        let path = self.object_path(bucket, name);
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(BlobError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: name.to_string(),
            }),
            Err(err) => Err(BlobError::Io(err)),
        }
    }

    /// The payload-owning object a link should point at: the target itself,
    /// or the target's own target when the target is a link.
    async fn link_destination(&self, target_object_key: &str) -> BlobResult<BlobObject> {
        let (bucket, name) = self.parse_key(target_object_key)?;
        let target = self.require_object(bucket, name).await?;
        match target.link_target.as_deref() {
            Some(next) => {
                let (bucket, name) = self.parse_key(next)?;
                self.require_object(bucket, name).await
            }
            None => Ok(target),
        }
    }

    /// Recursively remove empty directories up to bucket root.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn create_bucket(&self, bucket: &str) -> BlobResult<Bucket> {
        self.ensure_bucket_name_safe(bucket)?;
        fs::create_dir_all(self.bucket_root(bucket)).await?;

        let record = Bucket {
            name: bucket.to_string(),
            created_at: Utc::now(),
        };

        match sqlx::query("INSERT INTO blob_buckets (name, created_at) VALUES (?, ?)")
            .bind(&record.name)
            .bind(record.created_at)
            .execute(&*self.db)
            .await
        {
            Ok(_) => {
                info!(bucket, "created bucket");
                Ok(record)
            }
            Err(err) if is_unique_violation(&err) => {
                Err(BlobError::BucketAlreadyExists(bucket.to_string()))
            }
            Err(err) => Err(BlobError::Sqlx(err)),
        }
    }

    async fn bucket_exists(&self, bucket: &str) -> BlobResult<bool> {
        match self.fetch_bucket(bucket).await {
            Ok(_) => Ok(true),
            Err(BlobError::BucketNotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn exists(&self, bucket: &str, name: &str) -> BlobResult<bool> {
        self.ensure_key_safe(name)?;
        Ok(self.fetch_object(bucket, name).await?.is_some())
    }

    async fn put(&self, bucket: &str, name: &str, source: &Path) -> BlobResult<String> {
        let file = File::open(source).await?;
        self.store_stream(bucket, name, ReaderStream::new(file), WriteMode::CreateNew)
            .await
    }

    async fn get(&self, bucket: &str, name: &str) -> BlobResult<Bytes> {
        self.ensure_key_safe(name)?;
        let object = self.require_object(bucket, name).await?;
        match object.link_target.as_deref() {
            Some(target) => {
                let (target_bucket, target_name) = self.parse_key(target)?;
                debug!(bucket, name, target, "serving link target");
                self.read_payload(target_bucket, target_name).await
            }
            None => self.read_payload(bucket, name).await,
        }
    }

    async fn get_body(&self, object_key: &str) -> BlobResult<Bytes> {
        let (bucket, name) = self.parse_key(object_key)?;
        self.get(bucket, name).await
    }

    async fn put_body(&self, object_key: &str, body: Bytes) -> BlobResult<()> {
        let (bucket, name) = self.parse_key(object_key)?;
        let body = stream::once(async move { Ok::<_, io::Error>(body) });
        self.store_stream(bucket, name, body, WriteMode::Replace)
            .await?;
        Ok(())
    }

    async fn delete(&self, bucket: &str, name: &str) -> BlobResult<()> {
        self.ensure_key_safe(name)?;
        self.fetch_bucket(bucket).await?;
        let object = self.require_object(bucket, name).await?;

        sqlx::query("DELETE FROM blob_objects WHERE bucket = ? AND name = ?")
            .bind(bucket)
            .bind(name)
            .execute(&*self.db)
            .await?;

        if object.is_link() {
            return Ok(());
        }

        let file_path = self.object_path(bucket, name);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(BlobError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent, &self.bucket_root(bucket)).await;
        }

        Ok(())
    }

    async fn create_link(
        &self,
        bucket: &str,
        target_object_key: &str,
        link_name: &str,
    ) -> BlobResult<String> {
        self.ensure_key_safe(link_name)?;
        self.fetch_bucket(bucket).await?;
        let target = self.link_destination(target_object_key).await?;
        let target_key = object_key(&target.bucket, &target.name);

        let inserted = sqlx::query(
            "INSERT INTO blob_objects (bucket, name, size_bytes, etag, link_target, last_modified)
             VALUES (?, ?, ?, NULL, ?, ?)",
        )
        .bind(bucket)
        .bind(link_name)
        .bind(target.size_bytes)
        .bind(&target_key)
        .bind(Utc::now())
        .execute(&*self.db)
        .await;

        match inserted {
            Ok(_) => {
                debug!(bucket, link_name, target = %target_key, "created link");
                Ok(object_key(bucket, link_name))
            }
            Err(err) if is_unique_violation(&err) => Err(BlobError::ObjectAlreadyExists {
                bucket: bucket.to_string(),
                key: link_name.to_string(),
            }),
            Err(err) => Err(BlobError::Sqlx(err)),
        }
    }

    async fn repoint_link(&self, link_key: &str, target_object_key: &str) -> BlobResult<()> {
        let (bucket, name) = self.parse_key(link_key)?;
        let link = self.require_object(bucket, name).await?;
        if !link.is_link() {
            return Err(BlobError::NotALink(link_key.to_string()));
        }
        let target = self.link_destination(target_object_key).await?;

        sqlx::query(
            "UPDATE blob_objects SET link_target = ?, size_bytes = ?, last_modified = ?
             WHERE bucket = ? AND name = ?",
        )
        .bind(object_key(&target.bucket, &target.name))
        .bind(target.size_bytes)
        .bind(Utc::now())
        .bind(bucket)
        .bind(name)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    async fn resolve_link(&self, bucket: &str, name: &str) -> BlobResult<Option<String>> {
        self.ensure_key_safe(name)?;
        Ok(self.require_object(bucket, name).await?.link_target)
    }

    async fn list(&self, bucket: &str, prefix: Option<&str>) -> BlobResult<Vec<String>> {
        self.fetch_bucket(bucket).await?;

        let mut builder =
            QueryBuilder::<Sqlite>::new("SELECT name FROM blob_objects WHERE bucket = ");
        builder.push_bind(bucket);
        if let Some(prefix) = prefix.filter(|p| !p.is_empty()) {
            builder.push(" AND substr(name, 1, ");
            builder.push_bind(prefix.chars().count() as i64);
            builder.push(") = ");
            builder.push_bind(prefix);
        }
        builder.push(" ORDER BY name ASC");

        let names: Vec<String> = builder
            .build_query_scalar()
            .fetch_all(&*self.db)
            .await?;
        Ok(names)
    }

    async fn size(&self, bucket: &str, name: &str) -> BlobResult<i64> {
        self.ensure_key_safe(name)?;
        Ok(self.require_object(bucket, name).await?.size_bytes)
    }
}

/// Drain `stream` into a new file at `path`, returning size and MD5 hex.
async fn write_temp<S>(path: &Path, stream: S) -> io::Result<(i64, String)>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    let mut file = File::create(path).await?;
    let mut size_bytes: i64 = 0;
    let mut digest = Context::new();
    pin_mut!(stream);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        size_bytes += chunk.len() as i64;
        digest.consume(&chunk);
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok((size_bytes, format!("{:x}", digest.compute())))
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

/// Check if a string matches IPv4-like dotted decimal form.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|segment| {
            !segment.is_empty()
                && segment.len() <= 3
                && segment.chars().all(|c| c.is_ascii_digit())
                && segment.parse::<u8>().is_ok()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use tempfile::TempDir;

    async fn store() -> (LocalBlobStore, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(memory_pool().await, dir.path().join("objects"));
        store.create_bucket("alice").await.unwrap();
        store.create_bucket("bob").await.unwrap();
        (store, dir)
    }

    async fn staged(dir: &TempDir, name: &str, body: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, body).await.unwrap();
        path
    }

    #[tokio::test]
    async fn put_get_size_and_delete() {
        let (store, dir) = store().await;
        let src = staged(&dir, "a.txt", b"hello world").await;

        let key = store.put("alice", "a.txt", &src).await.unwrap();
        assert_eq!(key, "alice/a.txt");
        assert!(store.exists("alice", "a.txt").await.unwrap());
        assert_eq!(store.size("alice", "a.txt").await.unwrap(), 11);
        assert_eq!(&store.get("alice", "a.txt").await.unwrap()[..], b"hello world");
        assert_eq!(store.resolve_link("alice", "a.txt").await.unwrap(), None);

        let path = store.object_path("alice", "a.txt");
        assert!(path.exists());
        store.delete("alice", "a.txt").await.unwrap();
        assert!(!path.exists());
        assert!(!store.exists("alice", "a.txt").await.unwrap());
        assert!(store.bucket_root("alice").exists());
    }

    #[tokio::test]
    async fn put_never_replaces_an_existing_object() {
        let (store, dir) = store().await;
        let first = staged(&dir, "a.txt", b"first").await;
        let second = staged(&dir, "b.txt", b"second writer").await;
        store.put("alice", "a.txt", &first).await.unwrap();

        let err = store.put("alice", "a.txt", &second).await.unwrap_err();
        assert!(matches!(err, BlobError::ObjectAlreadyExists { .. }));
        assert_eq!(&store.get("alice", "a.txt").await.unwrap()[..], b"first");
        assert_eq!(store.size("alice", "a.txt").await.unwrap(), 5);

        store.create_link("bob", "alice/a.txt", "l.txt").await.unwrap();
        let err = store.put("bob", "l.txt", &second).await.unwrap_err();
        assert!(matches!(err, BlobError::ObjectAlreadyExists { .. }));
        assert_eq!(
            store.resolve_link("bob", "l.txt").await.unwrap().as_deref(),
            Some("alice/a.txt")
        );

        let mut leftovers = std::fs::read_dir(store.object_path("alice", "a.txt").parent().unwrap())
            .unwrap()
            .flatten()
            .map(|entry| entry.file_name().to_string_lossy().into_owned());
        assert!(leftovers.all(|name| !name.starts_with(".tmp-")));
    }

    #[tokio::test]
    async fn link_serves_target_bytes_without_payload() {
        let (store, dir) = store().await;
        let src = staged(&dir, "a.txt", b"shared").await;
        store.put("alice", "a.txt", &src).await.unwrap();

        let link = store.create_link("bob", "alice/a.txt", "b.txt").await.unwrap();
        assert_eq!(link, "bob/b.txt");
        assert!(!store.object_path("bob", "b.txt").exists());
        assert_eq!(&store.get("bob", "b.txt").await.unwrap()[..], b"shared");
        assert_eq!(store.size("bob", "b.txt").await.unwrap(), 6);
        assert_eq!(
            store.resolve_link("bob", "b.txt").await.unwrap().as_deref(),
            Some("alice/a.txt")
        );
    }

    #[tokio::test]
    async fn link_to_link_is_flattened() {
        let (store, dir) = store().await;
        let src = staged(&dir, "a.txt", b"x").await;
        store.put("alice", "a.txt", &src).await.unwrap();
        store.create_link("bob", "alice/a.txt", "b.txt").await.unwrap();

        store.create_link("bob", "bob/b.txt", "c.txt").await.unwrap();
        assert_eq!(
            store.resolve_link("bob", "c.txt").await.unwrap().as_deref(),
            Some("alice/a.txt")
        );
    }

    #[tokio::test]
    async fn link_name_collision_is_rejected() {
        let (store, dir) = store().await;
        let src = staged(&dir, "a.txt", b"x").await;
        store.put("alice", "a.txt", &src).await.unwrap();

        let err = store
            .create_link("alice", "alice/a.txt", "a.txt")
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::ObjectAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn put_body_turns_link_into_object() {
        let (store, dir) = store().await;
        let src = staged(&dir, "a.txt", b"promote me").await;
        store.put("alice", "a.txt", &src).await.unwrap();
        store.create_link("bob", "alice/a.txt", "b.txt").await.unwrap();

        let body = store.get_body("alice/a.txt").await.unwrap();
        store.put_body("bob/b.txt", body).await.unwrap();
        store.delete("alice", "a.txt").await.unwrap();

        assert_eq!(store.resolve_link("bob", "b.txt").await.unwrap(), None);
        assert_eq!(&store.get("bob", "b.txt").await.unwrap()[..], b"promote me");
    }

    #[tokio::test]
    async fn repoint_link_moves_target() {
        let (store, dir) = store().await;
        let src = staged(&dir, "a.txt", b"abc").await;
        store.put("alice", "a.txt", &src).await.unwrap();
        store.put("bob", "a.txt", &src).await.unwrap();
        store.create_link("bob", "alice/a.txt", "l.txt").await.unwrap();

        store.repoint_link("bob/l.txt", "bob/a.txt").await.unwrap();
        assert_eq!(
            store.resolve_link("bob", "l.txt").await.unwrap().as_deref(),
            Some("bob/a.txt")
        );

        let err = store.repoint_link("bob/a.txt", "alice/a.txt").await.unwrap_err();
        assert!(matches!(err, BlobError::NotALink(_)));
    }

    #[tokio::test]
    async fn list_is_sorted_and_prefix_filtered() {
        let (store, dir) = store().await;
        let src = staged(&dir, "x", b"x").await;
        for name in ["b.txt", "a.txt", "notes_1.md", "notes_2.md"] {
            store.put("alice", name, &src).await.unwrap();
        }

        assert_eq!(
            store.list("alice", None).await.unwrap(),
            vec!["a.txt", "b.txt", "notes_1.md", "notes_2.md"]
        );
        assert_eq!(
            store.list("alice", Some("notes_")).await.unwrap(),
            vec!["notes_1.md", "notes_2.md"]
        );
        assert!(store.list("bob", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_objects_and_buckets() {
        let (store, _dir) = store().await;

        let err = store.get("alice", "nope.txt").await.unwrap_err();
        assert!(err.is_not_found());
        let err = store.delete("alice", "nope.txt").await.unwrap_err();
        assert!(matches!(err, BlobError::ObjectNotFound { .. }));
        let err = store.list("carol", None).await.unwrap_err();
        assert!(matches!(err, BlobError::BucketNotFound(_)));
        assert!(!store.bucket_exists("carol").await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_bucket_is_rejected() {
        let (store, _dir) = store().await;
        let err = store.create_bucket("alice").await.unwrap_err();
        assert!(matches!(err, BlobError::BucketAlreadyExists(_)));
    }

    #[tokio::test]
    async fn name_validation() {
        let (store, _dir) = store().await;
        for bad in ["ab", "Upper", "-lead", "trail.", "a..b", "a.-b", "192.168.0.1"] {
            assert!(
                matches!(
                    store.ensure_bucket_name_safe(bad),
                    Err(BlobError::InvalidBucketName { .. })
                ),
                "{bad} should be rejected"
            );
        }
        assert!(store.ensure_bucket_name_safe("user-42.files").is_ok());

        for bad in ["", "/abs", "../escape", "tab\tname", "back\\slash"] {
            assert!(store.ensure_key_safe(bad).is_err(), "{bad:?} should be rejected");
        }
        assert!(store.ensure_key_safe("photos/2025/img.jpg").is_ok());
    }
}
