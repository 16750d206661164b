//! src/services/dedup_engine.rs
//!
//! DedupStorageEngine — content-addressed deduplication between a
//! `BlobStore` and a `MetadataIndex`.
//!
//! Every stored object has one catalog record. The first upload of some
//! content becomes the canonical record and owns the bytes; later uploads of
//! the same content become link records pointing at the canonical object key
//! through `metadata.original-key`. The metadata index is the source of truth
//! for link resolution.
//!
//! Upload and delete serialise per content hash, so the canonical/link
//! decision is never made by two requests at once within this process.

use crate::{
    models::{
        bucket::Bucket,
        file_record::{FileListing, FileMetadata, FileRecord, files_index_mapping},
    },
    services::{
        blob_store::{BlobError, BlobStore},
        hasher,
        key_locks::KeyedLocks,
        metadata_index::{Hit, IndexError, MetadataIndex},
        naming::{basename, extension_suffix, generate_unique_name, object_key},
    },
};
use chrono::Utc;
use futures::{StreamExt, stream::BoxStream};
use serde_json::{Map, Value, json};
use std::{
    fmt, io,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

pub(crate) const FIELD_FILE_HASH: &str = "file_hash";
pub(crate) const FIELD_OBJECT_KEY: &str = "object_key";
pub(crate) const FIELD_ORIGINAL_KEY: &str = "metadata.original-key";

const MAX_NAME_ATTEMPTS: usize = 8;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("file `{name}` not found in bucket `{bucket}`")]
    NotFound { bucket: String, name: String },
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("bucket `{0}` already exists")]
    BucketAlreadyExists(String),
    #[error("invalid name: {0}")]
    InvalidName(String),
    #[error("blob store failed to {operation} `{target}`: {source}")]
    Blob {
        operation: &'static str,
        target: String,
        #[source]
        source: BlobError,
    },
    #[error("metadata index failed to {operation} `{target}`: {source}")]
    Index {
        operation: &'static str,
        target: String,
        #[source]
        source: IndexError,
    },
    #[error("failed to hash `{path}`: {source}")]
    Hash {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to stage download: {0}")]
    Staging(#[source] io::Error),
    #[error("catalog record `{id}` is malformed: {source}")]
    Corrupt {
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EngineError::NotFound { .. } | EngineError::BucketNotFound(_)
        )
    }

    fn not_found(bucket: &str, name: &str) -> Self {
        EngineError::NotFound {
            bucket: bucket.to_string(),
            name: name.to_string(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Wrap a blob-store failure with the operation and object it concerned.
/// Validation and missing-bucket errors keep their own kinds.
pub(crate) fn blob_error(
    operation: &'static str,
    target: impl Into<String>,
) -> impl FnOnce(BlobError) -> EngineError {
    let target = target.into();
    move |source| match source {
        BlobError::BucketNotFound(bucket) => EngineError::BucketNotFound(bucket),
        BlobError::BucketAlreadyExists(bucket) => EngineError::BucketAlreadyExists(bucket),
        BlobError::InvalidBucketName { .. } | BlobError::InvalidObjectKey(_) => {
            EngineError::InvalidName(source.to_string())
        }
        source => {
            error!(operation, target = %target, "blob store failure: {}", source);
            EngineError::Blob {
                operation,
                target,
                source,
            }
        }
    }
}

pub(crate) fn index_error(
    operation: &'static str,
    target: impl Into<String>,
) -> impl FnOnce(IndexError) -> EngineError {
    let target = target.into();
    move |source| {
        error!(operation, target = %target, "metadata index failure: {}", source);
        EngineError::Index {
            operation,
            target,
            source,
        }
    }
}

/// A catalog record together with its document id.
#[derive(Debug, Clone)]
pub(crate) struct StoredRecord {
    pub id: String,
    pub record: FileRecord,
}

impl TryFrom<Hit> for StoredRecord {
    type Error = EngineError;

    fn try_from(hit: Hit) -> Result<Self, Self::Error> {
        let record = serde_json::from_value(hit.source).map_err(|source| EngineError::Corrupt {
            id: hit.id.clone(),
            source,
        })?;
        Ok(Self { id: hit.id, record })
    }
}

/// Result of an upload.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadOutcome {
    /// The canonical object key holding the bytes.
    pub object_key: String,
    /// Name of the link created in the target bucket when the content was
    /// already stored.
    pub link_name: Option<String>,
}

impl UploadOutcome {
    pub fn deduplicated(&self) -> bool {
        self.link_name.is_some()
    }
}

/// A downloaded file staged on local disk. The caller owns `path`.
#[derive(Debug, Clone)]
pub struct Download {
    pub path: PathBuf,
    pub display_name: String,
}

/// Confirmation of a delete.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteReceipt {
    pub object_key: String,
    /// Link that became canonical in place of the deleted object.
    pub promoted: Option<String>,
    /// Number of other links moved onto the promoted object.
    pub repointed: usize,
}

impl fmt::Display for DeleteReceipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "File '{}' deleted.", self.object_key)
    }
}

#[derive(Clone)]
pub struct DedupStorageEngine {
    pub(crate) blobs: Arc<dyn BlobStore>,
    pub(crate) index: Arc<dyn MetadataIndex>,
    pub(crate) index_name: String,
    hash_locks: KeyedLocks,
}

impl DedupStorageEngine {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        index: Arc<dyn MetadataIndex>,
        index_name: impl Into<String>,
    ) -> Self {
        Self {
            blobs,
            index,
            index_name: index_name.into(),
            hash_locks: KeyedLocks::new(),
        }
    }

    /// Create the files index if it does not exist yet.
    pub async fn init(&self) -> EngineResult<()> {
        let created = self
            .index
            .ensure_index(&self.index_name, &files_index_mapping())
            .await
            .map_err(index_error("create index", &self.index_name))?;
        if created {
            info!(index = %self.index_name, "created files index");
        }
        Ok(())
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    /// Confirm the files index is reachable and its writes are visible.
    pub async fn refresh_index(&self) -> EngineResult<()> {
        self.index
            .refresh(&self.index_name)
            .await
            .map_err(index_error("refresh", &self.index_name))
    }

    /// Provision a bucket, typically one per account.
    pub async fn create_bucket(&self, bucket: &str) -> EngineResult<Bucket> {
        self.blobs
            .create_bucket(bucket)
            .await
            .map_err(blob_error("create bucket", bucket))
    }

    /// Store the local file at `source` in `bucket`.
    ///
    /// Content already present anywhere in the system is not uploaded again:
    /// a link to the canonical object is created under the requested name
    /// and the outcome carries that link name. Otherwise the bytes are
    /// uploaded as a new canonical object. A name already taken in the
    /// bucket is replaced by a generated one.
    pub async fn upload(
        &self,
        source: &Path,
        bucket: &str,
        desired_name: Option<&str>,
    ) -> EngineResult<UploadOutcome> {
        let uploaded_name = basename(source)
            .ok_or_else(|| EngineError::InvalidName(source.display().to_string()))?;
        let exists = self
            .blobs
            .bucket_exists(bucket)
            .await
            .map_err(blob_error("check bucket", bucket))?;
        if !exists {
            return Err(EngineError::BucketNotFound(bucket.to_string()));
        }

        let digest = hasher::hash_file(source)
            .await
            .map_err(|source_err| EngineError::Hash {
                path: source.display().to_string(),
                source: source_err,
            })?;
        let _guard = self.hash_locks.lock(&digest).await;

        let matches = self.search(FIELD_FILE_HASH, &digest).await?;
        let requested = desired_name
            .filter(|name| !name.is_empty())
            .unwrap_or(&uploaded_name);
        let canonical = canonical_source(&matches);
        let (name, stored_key) = self
            .claim_name(bucket, requested, source, canonical.as_deref())
            .await?;

        let Some(canonical_key) = canonical else {
            let record = FileRecord {
                file_name: name,
                file_hash: digest,
                object_key: stored_key.clone(),
                metadata: FileMetadata {
                    original_key: None,
                    original_file_name: Some(uploaded_name.clone()),
                    linked_file_hash: None,
                },
                timestamp: Some(Utc::now()),
            };
            self.index_record(&record).await?;

            info!(file = %uploaded_name, object_key = %stored_key, "uploaded and indexed");
            return Ok(UploadOutcome {
                object_key: stored_key,
                link_name: None,
            });
        };

        let record = FileRecord {
            file_name: name.clone(),
            file_hash: digest.clone(),
            object_key: stored_key.clone(),
            metadata: FileMetadata {
                original_key: Some(canonical_key.clone()),
                original_file_name: Some(uploaded_name.clone()),
                linked_file_hash: Some(digest),
            },
            timestamp: Some(Utc::now()),
        };
        self.index_record(&record).await?;

        info!(
            file = %uploaded_name,
            canonical = %canonical_key,
            link = %stored_key,
            "content already stored; created link"
        );
        Ok(UploadOutcome {
            object_key: canonical_key,
            link_name: Some(name),
        })
    }

    /// Fetch `bucket/file_name` into a temporary file.
    ///
    /// Links are resolved through the catalog, so the file always holds the
    /// real bytes. The temp file keeps the name's extension and is left for
    /// the caller to remove.
    pub async fn download(&self, file_name: &str, bucket: &str) -> EngineResult<Download> {
        let stored = self.require_record(bucket, file_name).await?;

        let source_key = match stored.record.original_key() {
            Some(original) => {
                if self.find_by_key(original).await?.is_none() {
                    error!(
                        object_key = %stored.record.object_key,
                        original_key = original,
                        "link points at a record that no longer exists"
                    );
                    return Err(EngineError::not_found(bucket, file_name));
                }
                debug!(file_name, original_key = original, "resolved link");
                original.to_string()
            }
            None => stored.record.object_key.clone(),
        };

        let body = match self.blobs.get_body(&source_key).await {
            Ok(body) => body,
            Err(err) if err.is_not_found() => {
                error!(object_key = %source_key, "catalogued object missing from blob store");
                return Err(EngineError::not_found(bucket, file_name));
            }
            Err(err) => return Err(blob_error("download", source_key)(err)),
        };

        let path = stage_temp_file(&extension_suffix(file_name), &body).await?;
        info!(file_name, bucket, path = %path.display(), "downloaded");
        Ok(Download {
            path,
            display_name: stored.record.display_name().to_string(),
        })
    }

    /// Delete `bucket/file_name`.
    ///
    /// A canonical object with links is not allowed to take their bytes with
    /// it: one link is promoted to canonical first and the others are moved
    /// onto it.
    pub async fn delete(&self, file_name: &str, bucket: &str) -> EngineResult<DeleteReceipt> {
        let hash = self.require_record(bucket, file_name).await?.record.file_hash;
        let _guard = self.hash_locks.lock(&hash).await;
        // Re-read under the lock; a concurrent delete may have won.
        let stored = self.require_record(bucket, file_name).await?;
        let key = stored.record.object_key.clone();

        let promotion = self.promote_dependents(&stored).await?;

        match self.blobs.delete(bucket, file_name).await {
            Ok(()) => {}
            Err(BlobError::ObjectNotFound { .. }) => {
                warn!(object_key = %key, "blob already absent; removing catalog record only");
            }
            Err(err) => return Err(blob_error("delete", key.as_str())(err)),
        }

        self.index
            .delete_document(&self.index_name, &stored.id)
            .await
            .map_err(index_error("delete document", stored.id.as_str()))?;

        info!(object_key = %key, "deleted");
        Ok(DeleteReceipt {
            object_key: key,
            promoted: promotion.promoted,
            repointed: promotion.repointed,
        })
    }

    /// Stream the objects of `bucket` with their display names and sizes.
    ///
    /// Object names are enumerated when called; each entry is resolved as
    /// the stream is polled. Objects without a catalog record fall back to
    /// their object name.
    pub async fn list(
        &self,
        bucket: &str,
        prefix: Option<&str>,
    ) -> EngineResult<BoxStream<'_, EngineResult<FileListing>>> {
        self.list_after(bucket, prefix, None).await
    }

    /// Like `list`, starting after the object name `start_after`.
    ///
    /// Names are skipped before they are resolved. Objects removed between
    /// enumeration and resolution are left out of the stream.
    pub async fn list_after(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        start_after: Option<&str>,
    ) -> EngineResult<BoxStream<'_, EngineResult<FileListing>>> {
        let mut names = self
            .blobs
            .list(bucket, prefix)
            .await
            .map_err(blob_error("list", bucket))?;
        if let Some(after) = start_after {
            names.retain(|name| name.as_str() > after);
        }
        debug!(bucket, prefix, start_after, count = names.len(), "listing bucket");

        let bucket = bucket.to_string();
        Ok(futures::stream::iter(names)
            .then(move |name| {
                let bucket = bucket.clone();
                async move { self.describe(&bucket, name).await }
            })
            .filter_map(|described| async move { described.transpose() })
            .boxed())
    }

    /// Canonical object key behind `bucket/name`, `None` when it is canonical.
    pub async fn resolve_original_key(
        &self,
        bucket: &str,
        name: &str,
    ) -> EngineResult<Option<String>> {
        let stored = self.require_record(bucket, name).await?;
        Ok(stored.record.original_key().map(str::to_string))
    }

    /// Set one metadata key on a catalog record, keeping the other keys.
    pub async fn update_metadata_field(
        &self,
        doc_id: &str,
        key: &str,
        value: Value,
    ) -> EngineResult<()> {
        let hit = self
            .index
            .get_document(&self.index_name, doc_id)
            .await
            .map_err(index_error("get document", doc_id))?
            .ok_or_else(|| {
                index_error("get document", doc_id)(IndexError::DocumentNotFound {
                    index: self.index_name.clone(),
                    id: doc_id.to_string(),
                })
            })?;

        let mut metadata = match hit.source.get("metadata") {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        };
        metadata.insert(key.to_string(), value);

        self.index
            .update_document(&self.index_name, doc_id, &json!({ "metadata": metadata }))
            .await
            .map_err(index_error("update document", doc_id))?;

        info!(doc_id, key, "updated record metadata");
        Ok(())
    }

    async fn describe(&self, bucket: &str, name: String) -> EngineResult<Option<FileListing>> {
        let size_bytes = match self.blobs.size(bucket, &name).await {
            Ok(size) => size,
            Err(err) if err.is_not_found() => {
                debug!(bucket, name = %name, "object vanished while listing; skipped");
                return Ok(None);
            }
            Err(err) => return Err(blob_error("size", object_key(bucket, &name))(err)),
        };
        let display_name = match self.find_record(bucket, &name).await? {
            Some(stored) => stored.record.display_name().to_string(),
            None => {
                debug!(bucket, name = %name, "no catalog record; using object name");
                name.clone()
            }
        };
        Ok(Some(FileListing {
            display_name,
            object_name: name,
            size_bytes,
        }))
    }

    pub(crate) async fn search(&self, field: &str, value: &str) -> EngineResult<Vec<StoredRecord>> {
        self.index
            .search_term(&self.index_name, field, value)
            .await
            .map_err(index_error("search", format!("{}={}", field, value)))?
            .into_iter()
            .map(StoredRecord::try_from)
            .collect()
    }

    pub(crate) async fn find_by_key(&self, key: &str) -> EngineResult<Option<StoredRecord>> {
        Ok(self.search(FIELD_OBJECT_KEY, key).await?.into_iter().next())
    }

    pub(crate) async fn find_record(
        &self,
        bucket: &str,
        name: &str,
    ) -> EngineResult<Option<StoredRecord>> {
        self.find_by_key(&object_key(bucket, name)).await
    }

    async fn require_record(&self, bucket: &str, name: &str) -> EngineResult<StoredRecord> {
        self.find_record(bucket, name)
            .await?
            .ok_or_else(|| EngineError::not_found(bucket, name))
    }

    async fn index_record(&self, record: &FileRecord) -> EngineResult<String> {
        let document = serde_json::to_value(record).map_err(|source| EngineError::Corrupt {
            id: record.object_key.clone(),
            source,
        })?;
        self.index
            .index_document(&self.index_name, &document, None)
            .await
            .map_err(index_error("index document", record.object_key.as_str()))
    }

    /// Write `bucket/name` as a link to `canonical` or as a new object from
    /// `source`, returning the name used and its object key.
    ///
    /// A taken name is replaced by a generated one. The blob store refuses
    /// to overwrite, so a name claimed concurrently by another upload is
    /// detected at write time and retried under a fresh name.
    async fn claim_name(
        &self,
        bucket: &str,
        requested: &str,
        source: &Path,
        canonical: Option<&str>,
    ) -> EngineResult<(String, String)> {
        let taken = self
            .blobs
            .exists(bucket, requested)
            .await
            .map_err(blob_error("check object", object_key(bucket, requested)))?;
        let mut name = if taken {
            generate_unique_name(requested)
        } else {
            requested.to_string()
        };

        let mut attempt = 1;
        loop {
            let written = match canonical {
                Some(target) => self.blobs.create_link(bucket, target, &name).await,
                None => self.blobs.put(bucket, &name, source).await,
            };
            match written {
                Ok(key) => return Ok((name, key)),
                Err(BlobError::ObjectAlreadyExists { .. }) if attempt < MAX_NAME_ATTEMPTS => {
                    let unique = generate_unique_name(requested);
                    debug!(bucket, name = %name, unique = %unique, "name taken; generated a new one");
                    name = unique;
                    attempt += 1;
                }
                Err(err) => {
                    let operation = if canonical.is_some() { "create link" } else { "upload" };
                    return Err(blob_error(operation, object_key(bucket, &name))(err));
                }
            }
        }
    }
}

/// Object key of the canonical record among records sharing a hash.
///
/// Prefers the record that is itself canonical; otherwise follows the first
/// record's link.
fn canonical_source(matches: &[StoredRecord]) -> Option<String> {
    let first = matches.first()?;
    let chosen = matches
        .iter()
        .find(|stored| stored.record.is_canonical())
        .unwrap_or(first);
    Some(
        chosen
            .record
            .original_key()
            .unwrap_or(&chosen.record.object_key)
            .to_string(),
    )
}

/// Write `body` to a persisted temp file ending in `suffix`.
async fn stage_temp_file(suffix: &str, body: &[u8]) -> EngineResult<PathBuf> {
    let temp = tempfile::Builder::new()
        .prefix("dedup-download-")
        .suffix(suffix)
        .tempfile()
        .map_err(EngineError::Staging)?;
    let (file, path) = temp.keep().map_err(|err| EngineError::Staging(err.error))?;

    let mut file = tokio::fs::File::from_std(file);
    let written = async {
        file.write_all(body).await?;
        file.flush().await
    }
    .await;
    if let Err(err) = written {
        let _ = tokio::fs::remove_file(&path).await;
        return Err(EngineError::Staging(err));
    }
    Ok(path)
}
