//! API error taxonomy
//!
//! Every failure that crosses the HTTP boundary maps onto one of these
//! variants; handlers convert subsystem errors with enough context to
//! identify the offending resource.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Dependency timeout: {0}")]
    DependencyTimeout(String),

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Machine-readable code carried in the response envelope
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::Unauthorized(_) => "UNAUTHORIZED",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::DependencyTimeout(_) => "DCS_TIMEOUT",
            ApiError::ConfigInvalid(_) => "CONFIG_INVALID",
            ApiError::Internal(_) => "RUNTIME_ERROR",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::DependencyTimeout(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::ConfigInvalid(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "success": false,
            "code": self.code(),
            "message": self.to_string(),
            "error": self.to_string(),
        }));

        (self.status(), body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;

impl From<crate::store::StoreError> for ApiError {
    fn from(e: crate::store::StoreError) -> Self {
        match e {
            crate::store::StoreError::NotFound(msg) => ApiError::NotFound(msg),
            crate::store::StoreError::Duplicate(msg) => ApiError::Conflict(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<crate::resource::ControllerError> for ApiError {
    fn from(e: crate::resource::ControllerError) -> Self {
        use crate::resource::ControllerError;
        match e {
            ControllerError::Validation(msg) => ApiError::Validation(msg),
            ControllerError::NotFound(msg) => ApiError::NotFound(msg),
            ControllerError::ConfigInvalid(msg) => ApiError::ConfigInvalid(msg),
            ControllerError::DcsTimeout(msg) => ApiError::DependencyTimeout(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<crate::stack::OrchestratorError> for ApiError {
    fn from(e: crate::stack::OrchestratorError) -> Self {
        use crate::stack::OrchestratorError;
        match e {
            OrchestratorError::Validation(msg) => ApiError::Validation(msg),
            OrchestratorError::NotFound(msg) => ApiError::NotFound(msg),
            OrchestratorError::Conflict(msg) => ApiError::Conflict(msg),
            OrchestratorError::Busy(msg) => ApiError::Conflict(msg),
            OrchestratorError::Controller(inner) => ApiError::from(inner),
            OrchestratorError::Store(inner) => ApiError::from(inner),
            other => ApiError::Internal(other.to_string()),
        }
    }
}
