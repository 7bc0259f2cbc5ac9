//! Uniform API error responses.
//!
//! Every handler returns `Result<T, ApiError>`; the single
//! [`IntoResponse`] impl is the only place error bodies are serialized,
//! so every failure looks the same on the wire:
//! `{"success": false, "error": <kind>, "message": ..., "details"?}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use easel_core::{CoreError, ErrorKind};

/// An error ready to be serialized to a client.
#[derive(Debug)]
pub struct ApiError {
    kind: ErrorKind,
    message: String,
    details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::JobNotFound, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidFieldValue, message)
    }

    pub fn unauthorized() -> Self {
        Self::new(ErrorKind::Unauthorized, "missing or invalid API key")
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    fn status(&self) -> StatusCode {
        match self.kind {
            ErrorKind::MissingRequiredField
            | ErrorKind::InvalidFieldValue
            | ErrorKind::InvalidTransition => StatusCode::BAD_REQUEST,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::BackendNotFound
            | ErrorKind::JobNotFound
            | ErrorKind::CatalogEntryNotFound => StatusCode::NOT_FOUND,
            ErrorKind::BackendTransport | ErrorKind::BackendRejected => StatusCode::BAD_GATEWAY,
            ErrorKind::StorageError | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        let details = match &e {
            CoreError::InvalidTransition { from, action, .. } => Some(json!({
                "current_status": from.as_str(),
                "attempted": action,
            })),
            _ => None,
        };
        Self {
            kind: e.kind(),
            message: e.to_string(),
            details,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "success": false,
            "error": self.kind.as_str(),
            "message": self.message,
        });
        if let Some(ref details) = self.details {
            body["details"] = details.clone();
        }
        (self.status(), Json(body)).into_response()
    }
}
