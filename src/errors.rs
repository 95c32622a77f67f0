//! Error types surfaced by the dispatch pipeline to the edge layer.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: u16,
    pub description: String,
    pub data: serde_json::Value,
}

/// Errors the dispatcher / edge layer can surface. `VendorRetriable` never
/// reaches here — the retry engine absorbs it until the attempt cap, at
/// which point it becomes `VendorTerminal`.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{0}")]
    ValidationError(String),

    #[error("{platform} {app_id} app is not configured")]
    NotConfigured { app_id: String, platform: String },

    #[error("{0}")]
    NotFound(String),

    #[error("access denied by access list")]
    AccessDenied,

    #[error("storage error: {0}")]
    StoreError(String),

    #[error("renderer failure: {0}")]
    RendererError(String),

    #[error("{reason}")]
    VendorTerminal { code: u16, reason: String },

    #[error("{reason}")]
    ExpiredToken { reason: String },
}

impl DispatchError {
    fn status(&self) -> StatusCode {
        match self {
            Self::ValidationError(_) => StatusCode::BAD_REQUEST,
            Self::NotConfigured { .. } => StatusCode::NOT_FOUND,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::AccessDenied => StatusCode::FORBIDDEN,
            Self::StoreError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::RendererError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::VendorTerminal { code, .. } => {
                StatusCode::from_u16(*code).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::ExpiredToken { .. } => StatusCode::GONE,
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorResponse {
            code: status.as_u16(),
            description: self.to_string(),
            data: serde_json::Value::Null,
        };
        (status, Json(body)).into_response()
    }
}
