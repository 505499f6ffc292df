use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::TaskStatus;

/// Every failure a handler can answer with. Each variant renders as a JSON body
/// carrying at least an `error` field.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Missing 'prompt' in request data.")]
    MissingPrompt,
    #[error("{0}")]
    InvalidBody(String),
    #[error("Task not found")]
    TaskNotFound { task_id: String },
    #[error("Task not completed yet")]
    NotCompleted { status: TaskStatus },
    #[error("Image generation already in progress. Please try again after current generation completes.")]
    Busy,
    #[error("Image path not found in task data")]
    MissingResultPath,
    #[error("Image file does not exist on disk")]
    FileMissing,
    #[error("Image not found")]
    ImageNotFound,
    #[error("No images found")]
    NoImages,
    #[error("{message}")]
    Generation { message: String, request_id: String },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::MissingPrompt | ApiError::InvalidBody(_) | ApiError::NotCompleted { .. } => {
                StatusCode::BAD_REQUEST
            }
            ApiError::TaskNotFound { .. } | ApiError::ImageNotFound | ApiError::NoImages => {
                StatusCode::NOT_FOUND
            }
            ApiError::Busy => StatusCode::TOO_MANY_REQUESTS,
            ApiError::MissingResultPath
            | ApiError::FileMissing
            | ApiError::Generation { .. }
            | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self {
            ApiError::TaskNotFound { task_id } => {
                json!({ "error": self.to_string(), "task_id": task_id })
            }
            ApiError::NotCompleted { status } => {
                json!({ "error": self.to_string(), "status": status })
            }
            ApiError::Busy => json!({ "error": self.to_string(), "status": "busy" }),
            ApiError::Generation { message, request_id } => {
                json!({ "error": message, "request_id": request_id })
            }
            ApiError::Internal(e) => {
                error!("request failed: {e:#}");
                json!({ "error": format!("{e:#}") })
            }
            _ => json!({ "error": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}
