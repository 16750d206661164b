use crate::services::dedup_engine::EngineError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::NotFound { .. } | EngineError::BucketNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::InvalidName(_) => StatusCode::BAD_REQUEST,
            EngineError::BucketAlreadyExists(_) => StatusCode::CONFLICT,
            EngineError::Blob { .. } | EngineError::Index { .. } => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Hash { .. } | EngineError::Staging(_) | EngineError::Corrupt { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        AppError::new(status, err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::blob_store::BlobError;

    #[test]
    fn engine_errors_map_to_statuses() {
        let cases = [
            (
                EngineError::NotFound {
                    bucket: "alice".into(),
                    name: "a.txt".into(),
                },
                StatusCode::NOT_FOUND,
            ),
            (EngineError::BucketNotFound("carol".into()), StatusCode::NOT_FOUND),
            (EngineError::InvalidName("../x".into()), StatusCode::BAD_REQUEST),
            (EngineError::BucketAlreadyExists("alice".into()), StatusCode::CONFLICT),
            (
                EngineError::Blob {
                    operation: "download",
                    target: "alice/a.txt".into(),
                    source: BlobError::Io(std::io::Error::other("disk gone")),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                EngineError::Hash {
                    path: "/tmp/a.txt".into(),
                    source: std::io::Error::other("unreadable"),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(AppError::from(err).status, expected);
        }
    }
}
