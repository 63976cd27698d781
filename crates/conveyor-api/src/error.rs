// Bounded API errors
//
// Endpoints log the internal detail and answer with a category label only;
// internal error text never reaches clients.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use conveyor_core::CoreError;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    category: &'static str,
}

impl ApiError {
    pub fn not_found() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            category: "not_found",
        }
    }

    pub fn validation() -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            category: "validation_failure",
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<CoreError> for ApiError {
    fn from(error: CoreError) -> Self {
        match &error {
            CoreError::NotFound(_) => tracing::debug!(error = %error, "request failed"),
            CoreError::Internal(_) | CoreError::Persist(_) => {
                tracing::error!(error = %error, "request failed")
            }
            _ => tracing::warn!(error = %error, "request failed"),
        }
        Self {
            status: StatusCode::from_u16(error.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            category: error.category(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"error": self.category}))).into_response()
    }
}
