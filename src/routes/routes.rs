//! Defines routes for bucket and file operations.
//!
//! ## Structure
//! - **Bucket-level endpoints**
//!   - `GET    /{bucket}` — list files (supports prefix, max-keys, continuation-token)
//!   - `PUT    /{bucket}` — create bucket
//!   - `POST   /{bucket}` — multipart upload
//!
//! - **File-level endpoints**
//!   - `PUT    /{bucket}/{*name}` — upload the request body as `name`
//!   - `GET    /{bucket}/{*name}` — download
//!   - `DELETE /{bucket}/{*name}` — delete, promoting a link if one depends on it
//!
//! The wildcard `*name` allows nested names like `photos/2025/img.jpg`.

use crate::handlers::{
    AppState,
    file_handlers::{
        create_bucket, delete_file, download_file, list_files, upload_multipart, upload_raw,
    },
    health_handlers::{healthz, readyz},
};
use axum::{
    Router,
    routing::{get, put},
};

/// Build the router; handlers share one `AppState`.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // File-level routes
        .route(
            "/{bucket}/{*name}",
            put(upload_raw).get(download_file).delete(delete_file),
        )
        // Bucket-level routes
        .route(
            "/{bucket}",
            get(list_files).put(create_bucket).post(upload_multipart),
        )
}
