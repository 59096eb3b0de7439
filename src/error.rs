use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("invalid link encoding")]
    InvalidEncoding,
    #[error("not found")]
    NotFound,
    #[error("user not found: {0}")]
    UserNotFound(String),
    #[error("no pending files to finalize")]
    EmptyCollection,
    #[error("pending collection is full ({limit} files)")]
    CollectionFull { limit: usize },
    #[error("invalid file descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("uploads are restricted to the administrator")]
    Forbidden,
    #[error("persistence failure: {0}")]
    Persistence(#[from] rusqlite::Error),
    #[error("external service failure: {0}")]
    ExternalService(String),
    #[error("delivery failure: {0}")]
    Delivery(String),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidEncoding | AppError::InvalidDescriptor(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound | AppError::UserNotFound(_) => StatusCode::NOT_FOUND,
            AppError::EmptyCollection => StatusCode::CONFLICT,
            AppError::CollectionFull { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::Persistence(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::ExternalService(_) | AppError::Delivery(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn client_message(&self) -> String {
        match self {
            AppError::InvalidEncoding => "Invalid link".to_string(),
            AppError::NotFound | AppError::UserNotFound(_) => "Not found".to_string(),
            // Storage details stay in the logs.
            AppError::Persistence(_) => "Temporary failure, please retry".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    retryable: bool,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        let body = ErrorBody {
            error: self.client_message(),
            retryable: matches!(self, AppError::Persistence(_)),
        };
        (status, Json(body)).into_response()
    }
}
