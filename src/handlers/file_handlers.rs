//! HTTP handlers for bucket and file operations.
//!
//! Uploads are streamed to a staging file before the engine sees them, so a
//! request body is never held in memory whole. Downloads stream the engine's
//! temp file back and unlink it once opened.

use crate::{
    errors::AppError,
    handlers::AppState,
    models::file_record::FileListing,
    services::{dedup_engine::UploadOutcome, naming::basename},
};
use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose};
use futures::{Stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::{fmt::Display, path::PathBuf};
use tempfile::TempDir;
use tokio::{fs::File, io::AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

const NEXT_TOKEN_HEADER: &str = "x-next-continuation-token";

/// Query params accepted by `GET /{bucket}`.
#[derive(Debug, Deserialize)]
pub struct ListFilesQuery {
    pub prefix: Option<String>,
    #[serde(rename = "max-keys")]
    pub max_keys: Option<usize>,
    #[serde(rename = "continuation-token")]
    pub continuation_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub object_key: String,
    pub link_name: Option<String>,
    pub deduplicated: bool,
}

impl From<UploadOutcome> for UploadResponse {
    fn from(outcome: UploadOutcome) -> Self {
        Self {
            deduplicated: outcome.deduplicated(),
            object_key: outcome.object_key,
            link_name: outcome.link_name,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub message: String,
    pub object_key: String,
    pub promoted: Option<String>,
    pub repointed: usize,
}

/// PUT `/{bucket}` — create bucket.
pub async fn create_bucket(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let created = state.engine.create_bucket(&bucket).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// GET `/{bucket}` — list files, supports ?prefix=&max-keys=&continuation-token=
pub async fn list_files(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    Query(q): Query<ListFilesQuery>,
) -> Result<Response, AppError> {
    let max_keys = q.max_keys.unwrap_or(1000).clamp(1, 1000);
    let start_after = q
        .continuation_token
        .as_deref()
        .map(decode_continuation_token);

    let mut page: Vec<FileListing> = state
        .engine
        .list_after(&bucket, q.prefix.as_deref(), start_after.as_deref())
        .await?
        .take(max_keys + 1)
        .try_collect()
        .await?;

    let truncated = page.len() > max_keys;
    page.truncate(max_keys);

    let mut response = Json(&page).into_response();
    if truncated {
        if let Some(last) = page.last() {
            let token = encode_continuation_token(&last.object_name);
            if let Ok(value) = HeaderValue::from_str(&token) {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static(NEXT_TOKEN_HEADER), value);
            }
        }
    }
    Ok(response)
}

/// POST `/{bucket}` — multipart upload with a `file` field and an optional
/// `name` field holding the desired object name.
pub async fn upload_multipart(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let mut staged: Option<(TempDir, PathBuf)> = None;
    let mut desired_name: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::bad_request(e.to_string()))?
    {
        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some("file") => {
                let file_name = field
                    .file_name()
                    .and_then(|name| basename(std::path::Path::new(name)))
                    .ok_or_else(|| AppError::bad_request("`file` field has no file name"))?;
                staged = Some(stage_upload(&file_name, field).await?);
            }
            Some("name") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::bad_request(e.to_string()))?;
                desired_name = Some(text);
            }
            other => debug!(field = ?other, "ignoring multipart field"),
        }
    }

    let (_staging, path) = staged.ok_or_else(|| AppError::bad_request("missing `file` field"))?;
    let outcome = state
        .engine
        .upload(&path, &bucket, desired_name.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(UploadResponse::from(outcome))))
}

/// PUT `/{bucket}/{*name}` — upload the raw request body as `name`.
pub async fn upload_raw(
    State(state): State<AppState>,
    Path((bucket, name)): Path<(String, String)>,
    body: Body,
) -> Result<impl IntoResponse, AppError> {
    let file_name = basename(std::path::Path::new(&name))
        .ok_or_else(|| AppError::bad_request(format!("invalid file name `{}`", name)))?;

    let (_staging, path) = stage_upload(&file_name, body.into_data_stream()).await?;
    let outcome = state.engine.upload(&path, &bucket, Some(&name)).await?;
    Ok((StatusCode::CREATED, Json(UploadResponse::from(outcome))))
}

/// GET `/{bucket}/{*name}` — download a file under its display name.
pub async fn download_file(
    State(state): State<AppState>,
    Path((bucket, name)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let download = state.engine.download(&name, &bucket).await?;

    let opened = File::open(&download.path).await;
    if let Err(err) = tokio::fs::remove_file(&download.path).await {
        warn!(path = %download.path.display(), "could not remove download temp file: {}", err);
    }
    let file = opened.map_err(|e| AppError::internal(format!("open download: {}", e)))?;
    let length = file
        .metadata()
        .await
        .map_err(|e| AppError::internal(format!("stat download: {}", e)))?
        .len();

    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    set_download_headers(response.headers_mut(), &download.display_name, length);
    Ok(response)
}

/// DELETE `/{bucket}/{*name}` — delete a file, promoting a link if needed.
pub async fn delete_file(
    State(state): State<AppState>,
    Path((bucket, name)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let receipt = state.engine.delete(&name, &bucket).await?;
    Ok(Json(DeleteResponse {
        message: receipt.to_string(),
        object_key: receipt.object_key,
        promoted: receipt.promoted,
        repointed: receipt.repointed,
    }))
}

/// Drain `stream` into `file_name` inside a fresh staging directory.
///
/// The directory, and with it the file, is removed when the returned
/// `TempDir` drops.
async fn stage_upload<S, E>(file_name: &str, stream: S) -> Result<(TempDir, PathBuf), AppError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let staging = tempfile::Builder::new()
        .prefix("dedup-upload-")
        .tempdir()
        .map_err(|e| AppError::internal(format!("create staging dir: {}", e)))?;
    let path = staging.path().join(file_name);

    let mut file = File::create(&path)
        .await
        .map_err(|e| AppError::internal(format!("create staging file: {}", e)))?;
    let mut stream = std::pin::pin!(stream);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| AppError::bad_request(format!("read body: {}", e)))?;
        file.write_all(&chunk)
            .await
            .map_err(|e| AppError::internal(format!("write staging file: {}", e)))?;
    }
    file.flush()
        .await
        .map_err(|e| AppError::internal(format!("flush staging file: {}", e)))?;

    Ok((staging, path))
}

fn set_download_headers(headers: &mut HeaderMap, display_name: &str, length: u64) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));

    let disposition = format!(
        "attachment; filename=\"{}\"",
        display_name.replace(['"', '\\'], "_")
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&disposition)
            .unwrap_or_else(|_| HeaderValue::from_static("attachment")),
    );
}

fn encode_continuation_token(token: &str) -> String {
    general_purpose::STANDARD.encode(token)
}

fn decode_continuation_token(token: &str) -> String {
    general_purpose::STANDARD
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| token.to_string())
}
