//! The API error taxonomy and its wire shape.
//!
//! Errors never cross component boundaries as panics; handlers end every
//! failing path by converting into [`ApiError`], whose response body is
//! `{"desc", "level", "code"}` with the mapped HTTP status.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use vigil_core::CoreError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Auth(String),
    #[error("{0}")]
    Json(String),
    #[error("{0}")]
    FieldRequired(String),
    #[error("{0}")]
    Input(String),
    #[error("{0}")]
    WrongInputType(String),
    #[error("{0}")]
    HostNotFound(String),
    #[error("{0}")]
    HcNotFound(String),
    #[error("{0}")]
    StatusUndefined(String),
    #[error("{0}")]
    Log(String),
    #[error("{0}")]
    PageNotFound(String),
    #[error("{0}")]
    Unknown(String),
}

impl ApiError {
    /// The stable code spelled on the wire.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Auth(_) => "AUTH_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::FieldRequired(_) => "FIELD_REQUIRED",
            Self::Input(_) => "INPUT_ERROR",
            Self::WrongInputType(_) => "WRONG_INPUT_TYPE",
            Self::HostNotFound(_) => "HOST_NOT_FOUND",
            Self::HcNotFound(_) => "HC_NOT_FOUND",
            Self::StatusUndefined(_) => "STATUS_UNDEFINED",
            Self::Log(_) => "LOG_ERROR",
            Self::PageNotFound(_) => "PAGE_NOT_FOUND",
            Self::Unknown(_) => "UNKNOWN_ERROR",
        }
    }

    const fn level(&self) -> &'static str {
        match self {
            Self::StatusUndefined(_) | Self::PageNotFound(_) => "warning",
            Self::Unknown(_) => "critical",
            _ => "error",
        }
    }

    const fn http_status(&self) -> StatusCode {
        match self {
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Json(_) | Self::FieldRequired(_) | Self::Input(_) | Self::WrongInputType(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::HostNotFound(_) | Self::HcNotFound(_) | Self::PageNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Self::StatusUndefined(_) | Self::Log(_) => StatusCode::CONFLICT,
            Self::Unknown(_) => StatusCode::NOT_IMPLEMENTED,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "desc": self.to_string(),
            "level": self.level(),
            "code": self.code(),
        });
        (self.http_status(), axum::Json(body)).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        error!("core failure: {err}");
        Self::Unknown(err.to_string())
    }
}
