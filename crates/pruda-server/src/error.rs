use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by the license authority, mapped to HTTP status codes at
/// the edge. Internal causes are logged, never leaked.
#[derive(Debug, Error)]
pub enum AuthorityError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    /// The presented HWID does not match the bound one under the active
    /// policy.
    #[error("HwidMismatch")]
    HwidMismatch,

    #[error("{0}")]
    Gone(String),

    /// Key generation kept colliding with existing licenses.
    #[error("license key space exhausted after {0} attempts")]
    KeyExhaustion(usize),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AuthorityError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthorityError::Validation(_) => StatusCode::BAD_REQUEST,
            AuthorityError::NotFound(_) => StatusCode::NOT_FOUND,
            AuthorityError::Conflict(_) | AuthorityError::HwidMismatch => StatusCode::CONFLICT,
            AuthorityError::Gone(_) => StatusCode::GONE,
            AuthorityError::KeyExhaustion(_) | AuthorityError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AuthorityError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "internal error");
            return (status, Json(json!({"message": "internal server error"}))).into_response();
        }
        (status, Json(json!({"message": self.to_string()}))).into_response()
    }
}
