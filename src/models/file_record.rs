//! Catalog documents describing every stored file, canonical or link.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Metadata key naming the canonical object a link points at.
pub const ORIGINAL_KEY: &str = "original-key";
/// Metadata key holding the name the file was uploaded under.
pub const ORIGINAL_FILE_NAME: &str = "original-file-name";
/// Metadata key recording the digest seen when a link was created.
pub const LINKED_FILE_HASH: &str = "linked-file-hash";

/// One document per stored object.
///
/// `file_hash` is the digest of the bytes this record serves; for a link
/// that is the digest of the canonical bytes it points at.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FileRecord {
    pub file_name: String,
    pub file_hash: String,
    pub object_key: String,
    #[serde(default)]
    pub metadata: FileMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct FileMetadata {
    /// Object key of the canonical record; `None` or empty on a canonical record.
    #[serde(rename = "original-key", default)]
    pub original_key: Option<String>,

    #[serde(
        rename = "original-file-name",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub original_file_name: Option<String>,

    #[serde(
        rename = "linked-file-hash",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub linked_file_hash: Option<String>,
}

impl FileRecord {
    /// A record is canonical when it does not point at another object.
    pub fn is_canonical(&self) -> bool {
        self.original_key().is_none()
    }

    /// The canonical object key this record links to, if any.
    pub fn original_key(&self) -> Option<&str> {
        self.metadata
            .original_key
            .as_deref()
            .filter(|key| !key.is_empty())
    }

    /// Name shown to users: the uploaded name, else the stored name.
    pub fn display_name(&self) -> &str {
        self.metadata
            .original_file_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.file_name)
    }
}

/// A catalog entry returned by a listing.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FileListing {
    pub display_name: String,
    pub object_name: String,
    pub size_bytes: i64,
}

/// Index mapping for the files catalog.
pub fn files_index_mapping() -> Value {
    json!({
        "properties": {
            "file_name": { "type": "keyword" },
            "file_hash": { "type": "keyword" },
            "object_key": { "type": "keyword" },
            "metadata": {
                "type": "object",
                "properties": {
                    "original-key": { "type": "keyword" }
                }
            },
            "timestamp": { "type": "date" }
        }
    })
}
