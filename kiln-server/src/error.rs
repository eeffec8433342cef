//! API error handling

use axum::{
    extract::rejection::JsonRejection,
    extract::multipart::{MultipartError, MultipartRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use kiln_core::validate::MIB;
use serde_json::json;
use tracing::{error, info};

use crate::api::BODY_LIMIT;

/// Error body shared by every endpoint: `{"detail": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, detail)
    }

    pub fn payload_too_large() -> Self {
        Self::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!(
                "Request body too large. Maximum request size is {}MB",
                BODY_LIMIT / MIB
            ),
        )
    }

    /// Maps a core error, hiding server faults behind `fallback`.
    pub fn from_core(err: kiln_core::Error, fallback: &str) -> Self {
        match err.as_client() {
            Some(client) => {
                info!(field = client.field, kind = %client.kind, "Rejected request: {}", client.detail);
                Self::bad_request(client.detail.clone())
            }
            None => {
                error!("{fallback}: {err}");
                Self::internal(fallback)
            }
        }
    }
}

impl From<kiln_core::ClientError> for ApiError {
    fn from(err: kiln_core::ClientError) -> Self {
        info!(field = err.field, kind = %err.kind, "Rejected request: {}", err.detail);
        Self::bad_request(err.detail)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(err: JsonRejection) -> Self {
        info!("Rejected JSON body: {}", err.body_text());
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            return Self::payload_too_large();
        }
        Self::bad_request(format!("Invalid JSON payload: {}", err.body_text()))
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(err: MultipartRejection) -> Self {
        info!("Rejected multipart body: {}", err.body_text());
        Self::bad_request(format!("Invalid multipart payload: {}", err.body_text()))
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        let status = err.status();
        info!(%status, "Failed reading multipart field: {}", err.body_text());
        if status == StatusCode::PAYLOAD_TOO_LARGE {
            return Self::payload_too_large();
        }
        Self::bad_request(format!("Failed reading multipart field: {}", err.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}
