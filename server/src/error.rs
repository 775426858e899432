use std::path::PathBuf;

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;
use tracing::warn;

use crate::annotations::AnnotationReadError;
use crate::core::pyramid::PyramidError;
use crate::core::viewport::ViewportError;
use crate::slide::SlideError;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("Failed to open slide: {0}")]
    ImageOpen(#[source] SlideError),

    #[error("Failed to read tile: {0}")]
    ImageRead(#[source] SlideError),

    #[error("Invalid level {level} (level_count={level_count})")]
    InvalidLevel { level: u32, level_count: u32 },

    #[error("No WSI file loaded")]
    NoImageLoaded,

    #[error("Failed to open segmentation file: {0}")]
    AnnotationOpen(#[source] AnnotationReadError),

    #[error("No segmentation file loaded")]
    NoAnnotationsLoaded,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ServiceError>;

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::FileNotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::NoImageLoaded
            | ServiceError::NoAnnotationsLoaded
            | ServiceError::InvalidLevel { .. }
            | ServiceError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::ImageOpen(_)
            | ServiceError::ImageRead(_)
            | ServiceError::AnnotationOpen(_)
            | ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<PyramidError> for ServiceError {
    fn from(err: PyramidError) -> Self {
        match err {
            PyramidError::InvalidLevel { level, level_count } => {
                ServiceError::InvalidLevel { level, level_count }
            }
            other => ServiceError::Internal(other.to_string()),
        }
    }
}

impl From<ViewportError> for ServiceError {
    fn from(err: ViewportError) -> Self {
        ServiceError::InvalidRequest(err.to_string())
    }
}

impl From<JsonRejection> for ServiceError {
    fn from(rejection: JsonRejection) -> Self {
        ServiceError::InvalidRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ServiceError {
    fn from(rejection: PathRejection) -> Self {
        ServiceError::InvalidRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ServiceError {
    fn from(rejection: QueryRejection) -> Self {
        ServiceError::InvalidRequest(rejection.body_text())
    }
}

impl From<tokio::task::JoinError> for ServiceError {
    fn from(err: tokio::task::JoinError) -> Self {
        ServiceError::Internal(format!("worker task failed: {}", err))
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!("request failed status={} err={}", status.as_u16(), self);
        }
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
