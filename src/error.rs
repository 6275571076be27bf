use std::time::Duration;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::config::ApiType;

/// Why a single upstream attempt failed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum UpstreamFailure {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("upstream returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("stream interrupted: {0}")]
    Stream(String),
}

impl UpstreamFailure {
    /// HTTP-equivalent status recorded for this failure.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Transport(_) | Self::Stream(_) => 502,
            Self::Timeout(_) => 504,
            Self::Status { status, .. } => *status,
        }
    }
}

/// A failed call, always attributed to exactly one provider.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("provider '{provider_id}' failed: {failure}")]
pub struct UpstreamError {
    pub provider_id: String,
    pub failure: UpstreamFailure,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No provider available for {0}")]
    NoProviderAvailable(ApiType),

    #[error("All {attempts} candidate provider(s) failed; last error: {last}")]
    AllProvidersFailed { attempts: usize, last: UpstreamError },

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Validation(_) | GatewayError::BadRequest(_) | GatewayError::Json(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::NoProviderAvailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::AllProvidersFailed { last, .. } => upstream_status(&last.failure),
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Http(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Cache(_)
            | GatewayError::Db(_)
            | GatewayError::Io(_)
            | GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error kind used in response bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "validation_error",
            GatewayError::NoProviderAvailable(_) => "no_provider_available",
            GatewayError::AllProvidersFailed { .. } => "all_providers_failed",
            GatewayError::Cache(_) => "cache_error",
            GatewayError::BadRequest(_) | GatewayError::Json(_) => "invalid_request_error",
            GatewayError::NotFound(_) => "not_found_error",
            GatewayError::Http(_) => "http_error",
            GatewayError::Db(_) | GatewayError::Io(_) | GatewayError::Config(_) => "internal_error",
        }
    }
}

fn upstream_status(failure: &UpstreamFailure) -> StatusCode {
    StatusCode::from_u16(failure.status_code()).unwrap_or(StatusCode::BAD_GATEWAY)
}

// 管理接口统一的 JSON 错误体；各协议监听器的错误体由 providers 适配器生成
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
