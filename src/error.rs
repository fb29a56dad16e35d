use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors raised by the registry and the dispatch engine.
///
/// Non-2xx answers from a remote service are not represented here; they are
/// returned to the caller as a [`crate::gateway::executor::RemoteResponse`].
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Malformed or incomplete profile data that the caller can fix.
    #[error("{0}")]
    Validation(String),

    /// Unknown endpoint id or an operation that is not in the catalogue.
    #[error("{0}")]
    NotFound(String),

    /// An auth scheme is selected without the fields it needs.
    #[error("{0}")]
    Configuration(String),

    /// A stored secret could not be decrypted, or the cipher could not be built.
    #[error("{0}")]
    Crypto(String),

    /// The remote endpoint could not be reached.
    #[error("{0}")]
    Transport(String),

    #[error("Database error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GatewayError {
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "validation",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::Configuration(_) => "configuration",
            GatewayError::Crypto(_) => "crypto",
            GatewayError::Transport(_) => "transport",
            GatewayError::Storage(_) => "storage",
            GatewayError::Serialization(_) => "serialization",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Configuration(_) => StatusCode::UNPROCESSABLE_ENTITY,
            GatewayError::Transport(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Crypto(_)
            | GatewayError::Storage(_)
            | GatewayError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Crypto and transport failures happen after the profile was loaded and
    /// count as a failed call for health bookkeeping.
    pub fn is_call_failure(&self) -> bool {
        matches!(self, GatewayError::Crypto(_) | GatewayError::Transport(_))
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match &self {
            GatewayError::Storage(e) => tracing::error!("Storage failure: {}", e),
            GatewayError::Crypto(e) => tracing::error!("Crypto failure: {}", e),
            _ => {}
        }
        let body = json!({
            "error": self.kind(),
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}
