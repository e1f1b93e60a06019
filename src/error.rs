use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

/// Problems caught locally, before anything is sent over the network.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("upload at least one furniture image first")]
    NoImages,
    #[error("enter your secret to verify access")]
    MissingSecret,
    #[error("file {filename} has an unsupported type ({mime})")]
    UnsupportedType { filename: String, mime: String },
    #[error("file {filename} is too large ({size} bytes, limit is {limit} bytes)")]
    TooLarge { filename: String, size: u64, limit: u64 },
    #[error("no valid image files in the selection")]
    NoValidFiles,
    #[error("image index {index} is out of range ({len} images)")]
    IndexOutOfRange { index: usize, len: usize },
}

#[derive(Debug, Clone, Error)]
pub enum UploadError {
    #[error("upload of {filename} timed out: the connection is too slow or unstable")]
    Timeout { filename: String },
    #[error("could not reach the image host while uploading {filename}: {message}")]
    Network { filename: String, message: String },
    #[error("upload of {filename} was rejected ({status}): {body}")]
    Rejected { filename: String, status: u16, body: String },
    #[error("upload of {filename} succeeded but no image URL was returned")]
    MalformedResponse { filename: String },
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("a generation is already running for this session")]
    InProgress,
    #[error("workflow request failed: {0}")]
    Http(String),
    #[error("workflow call failed ({status}): {body}")]
    Transport { status: u16, body: String },
    #[error("reading the workflow stream failed: {0}")]
    Stream(String),
    #[error("{0}")]
    Remote(String),
    #[error("the workflow finished without returning an image")]
    NoResult,
    #[error("generation cancelled")]
    Cancelled,
}

/// Service-level error returned by the HTTP handlers.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error("session {0} not found")]
    SessionNotFound(Uuid),
    #[error("invalid multipart body: {0}")]
    Multipart(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation",
            AppError::Upload(UploadError::Invalid(_)) => "validation",
            AppError::Upload(_) => "upload",
            AppError::Generation(e) => match e {
                GenerationError::Validation(_) => "validation",
                GenerationError::InProgress => "in_progress",
                GenerationError::Http(_) | GenerationError::Transport { .. } => "transport",
                GenerationError::Stream(_) => "stream",
                GenerationError::Remote(_) => "remote",
                GenerationError::NoResult => "no_result",
                GenerationError::Cancelled => "cancelled",
            },
            AppError::SessionNotFound(_) => "not_found",
            AppError::Multipart(_) => "validation",
            AppError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.kind() {
            "validation" => StatusCode::BAD_REQUEST,
            "not_found" => StatusCode::NOT_FOUND,
            "in_progress" | "cancelled" => StatusCode::CONFLICT,
            "internal" => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("❌ {} ({})", self, self.kind());
        }
        (status, Json(json!({ "error": self.to_string(), "kind": self.kind() }))).into_response()
    }
}
