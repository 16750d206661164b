//! Represents an object (file or link) stored in a bucket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Catalog row for a single blob-store object.
///
/// A row either owns a payload on disk or, when `link_target` is set, is a
/// link that serves the bytes of another object without a copy of its own.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct BlobObject {
    /// Parent bucket name.
    pub bucket: String,

    /// Object name within the bucket.
    pub name: String,

    /// Size in bytes of the content this object serves.
    pub size_bytes: i64,

    /// MD5 of the payload, absent for links.
    pub etag: Option<String>,

    /// `bucket/name` of the object whose bytes a link serves.
    pub link_target: Option<String>,

    /// Timestamp when object was last written.
    pub last_modified: DateTime<Utc>,
}

impl BlobObject {
    pub fn is_link(&self) -> bool {
        self.link_target.is_some()
    }
}
