//! Client-visible error mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use strata::Error;

/// API error: an HTTP status plus a JSON `{"error": ...}` body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    /// Builds an error response.
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// The canonical missing-image response.
    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "image not found")
    }

    /// A generic bad-request response.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    /// Returns the HTTP status.
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Invalid(_) | Error::Format(_) => StatusCode::BAD_REQUEST,
            Error::Store(store) if store.is_not_found() => StatusCode::NOT_FOUND,
            Error::Store(strata_store::StoreError::InvalidPath(_)) => StatusCode::BAD_REQUEST,
            Error::Store(_) | Error::Queue(_) | Error::Io(_) | Error::Json(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %err, "internal error");
            return Self::new(status, "internal error");
        }
        Self::new(status, err.to_string())
    }
}

impl From<strata_store::StoreError> for ApiError {
    fn from(err: strata_store::StoreError) -> Self {
        Error::from(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}
