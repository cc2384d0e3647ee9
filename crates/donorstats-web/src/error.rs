use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use donorstats_import::ImportError;
use donorstats_storage::StoreError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::push::PushError;

/// Every handler failure, rendered as `{"error": "..."}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Push(#[from] PushError),
    #[error(transparent)]
    Import(#[from] ImportError),
    #[error("Server error: {0}")]
    Store(#[from] StoreError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) | ApiError::Push(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Import(err) if err.is_client_error() => StatusCode::BAD_REQUEST,
            ApiError::Store(StoreError::Constraint(_)) => StatusCode::BAD_REQUEST,
            ApiError::Import(_) | ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
