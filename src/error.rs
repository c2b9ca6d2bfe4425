//! Admin-surface error taxonomy.
//!
//! Synchronous clients receive a structured `{error, detail?}` JSON body
//! with a stable code vocabulary (spec §7). Consumer-loop errors never reach
//! here; they stay inside `anyhow::Result` and are absorbed by the stream
//! runtime.

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("daily_target_reached")]
    Halted,
    #[error("missing_field: {0}")]
    MissingField(&'static str),
    #[error("pipeline_failed: {0}")]
    PipelineFailed(String),
    #[error("invalid_dlq_format")]
    InvalidDlqFormat,
    #[error("not_found")]
    NotFound,
    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl AdminError {
    fn code(&self) -> &'static str {
        match self {
            AdminError::Unauthorized => "unauthorized",
            AdminError::Halted => "halted",
            AdminError::MissingField(_) => "missing_field",
            AdminError::PipelineFailed(_) => "pipeline_failed",
            AdminError::InvalidDlqFormat => "invalid_dlq_format",
            AdminError::NotFound => "not_found",
            AdminError::Internal(_) => "internal_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AdminError::Unauthorized => StatusCode::UNAUTHORIZED,
            AdminError::Halted => StatusCode::CONFLICT,
            AdminError::MissingField(_) => StatusCode::BAD_REQUEST,
            AdminError::PipelineFailed(_) => StatusCode::BAD_GATEWAY,
            AdminError::InvalidDlqFormat => StatusCode::BAD_REQUEST,
            AdminError::NotFound => StatusCode::NOT_FOUND,
            AdminError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn detail(&self) -> Option<String> {
        match self {
            AdminError::MissingField(f) => Some(f.to_string()),
            AdminError::PipelineFailed(d) => Some(d.clone()),
            AdminError::Internal(e) => Some(e.to_string()),
            _ => None,
        }
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.code(),
            detail: self.detail(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halted_maps_to_409() {
        assert_eq!(AdminError::Halted.status(), StatusCode::CONFLICT);
        assert_eq!(AdminError::Halted.code(), "halted");
    }

    #[test]
    fn unauthorized_maps_to_401() {
        assert_eq!(AdminError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn not_found_maps_to_404() {
        assert_eq!(AdminError::NotFound.status(), StatusCode::NOT_FOUND);
    }
}
