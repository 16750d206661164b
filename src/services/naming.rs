//! Object naming helpers: object keys, basenames and collision-free names.

use std::path::Path;
use uuid::Uuid;

/// Fully-qualified identity of an object: `bucket/name`.
pub fn object_key(bucket: &str, name: &str) -> String {
    format!("{}/{}", bucket, name)
}

/// Split an object key at the bucket separator.
///
/// Bucket names never contain `/`, so everything after the first one is the
/// object name.
pub fn split_object_key(key: &str) -> Option<(&str, &str)> {
    key.split_once('/')
        .filter(|(bucket, name)| !bucket.is_empty() && !name.is_empty())
}

/// Final path component of an uploaded file.
pub fn basename(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
}

/// Extension of `name` including the leading dot, or an empty string.
pub fn extension_suffix(name: &str) -> String {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext))
        .unwrap_or_default()
}

/// Derive a fresh name from `name` by suffixing the base with a random id.
///
/// The extension after the last `.` is kept, so `a.txt` becomes
/// `a_<32 hex>.txt`.
pub fn generate_unique_name(name: &str) -> String {
    let (base, extension) = name.rsplit_once('.').unwrap_or((name, ""));
    let unique = format!("{}_{}", base, Uuid::new_v4().simple());
    if extension.is_empty() {
        unique
    } else {
        format!("{}.{}", unique, extension)
    }
}
