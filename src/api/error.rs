//! Unified API error handling with structured responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

use crate::auth::AuthError;
use crate::ssh::SshError;

/// API error type with structured responses.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Incompatible OS: {0}")]
    IncompatibleOs(String),

    #[error("Busy: {0}")]
    Busy(String),

    #[error("Locked: {0}")]
    Locked(String),

    #[error("Authentication required: {0}")]
    AuthRequired(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Upstream AI unavailable: {0}")]
    AiUnavailable(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn locked(msg: impl Into<String>) -> Self {
        Self::Locked(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) | Self::IncompatibleOs(_) | Self::Busy(_) | Self::Locked(_) => {
                StatusCode::CONFLICT
            }
            Self::AuthRequired(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::AiUnavailable(_) | Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::IncompatibleOs(_) => "INCOMPATIBLE_OS",
            Self::Busy(_) => "BUSY",
            Self::Locked(_) => "LOCKED",
            Self::AuthRequired(_) => "AUTH_REQUIRED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::AiUnavailable(_) => "AI_UNAVAILABLE",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Structured error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        match &self {
            ApiError::Internal(msg) => {
                error!(error_code = code, message = %msg, "API error");
            }
            ApiError::ServiceUnavailable(msg) | ApiError::AiUnavailable(msg) => {
                warn!(error_code = code, message = %msg, "Service unavailable");
            }
            _ => {
                tracing::debug!(error_code = code, message = %message, "Client error");
            }
        }

        let body = ErrorResponse {
            error: message,
            code,
        };

        (status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingBearer => {
                ApiError::AuthRequired("missing or invalid authorization".to_string())
            }
            AuthError::TokenExpired => ApiError::AuthRequired("token has expired".to_string()),
            AuthError::InvalidToken(msg) => ApiError::AuthRequired(format!("invalid token: {msg}")),
            AuthError::WrongTokenType(_) => ApiError::AuthRequired("wrong token type".to_string()),
            AuthError::InvalidCredentials => {
                ApiError::AuthRequired("invalid credentials".to_string())
            }
            AuthError::Config(msg) | AuthError::Internal(msg) => {
                ApiError::Internal(format!("authentication error: {msg}"))
            }
        }
    }
}

impl From<SshError> for ApiError {
    fn from(err: SshError) -> Self {
        match &err {
            SshError::Unreachable(_) | SshError::Timeout => {
                ApiError::ServiceUnavailable(err.to_string())
            }
            SshError::AuthFailed | SshError::HostKeyMismatch { .. } => {
                ApiError::BadRequest(err.to_string())
            }
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<crate::session::SessionError> for ApiError {
    fn from(err: crate::session::SessionError) -> Self {
        use crate::session::SessionError;
        match err {
            SessionError::Locked { locked_by } => {
                ApiError::Locked(format!("session is locked by {locked_by}"))
            }
            SessionError::InvalidState { state } => {
                ApiError::Conflict(format!("operation invalid in state {state}"))
            }
            SessionError::Terminated => ApiError::Conflict("session terminated".to_string()),
            SessionError::Ssh(err) => err.into(),
        }
    }
}

impl From<crate::session::ManagerError> for ApiError {
    fn from(err: crate::session::ManagerError) -> Self {
        use crate::session::ManagerError;
        match err {
            ManagerError::Capacity(limit) => {
                ApiError::ServiceUnavailable(format!("session limit reached ({limit})"))
            }
            ManagerError::NotFound(id) => ApiError::NotFound(format!("session {id} not found")),
            ManagerError::Session(err) => err.into(),
            ManagerError::Internal(err) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<crate::hunt::SchedulerError> for ApiError {
    fn from(err: crate::hunt::SchedulerError) -> Self {
        use crate::hunt::SchedulerError;
        match err {
            SchedulerError::ModuleNotFound(id) => {
                ApiError::NotFound(format!("hunt module '{id}' not found"))
            }
            SchedulerError::IncompatibleOs { module, os } => {
                ApiError::IncompatibleOs(format!("module '{module}' does not support os '{os}'"))
            }
            SchedulerError::Busy(session) => {
                ApiError::Busy(format!("session {session} already has a hunt in flight"))
            }
            SchedulerError::HuntNotFound(id) => ApiError::NotFound(format!("hunt {id} not found")),
            SchedulerError::Internal(err) => ApiError::Internal(err.to_string()),
        }
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_errors_map_to_4xx() {
        assert_eq!(
            ApiError::bad_request("x").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::not_found("x").status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::IncompatibleOs("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::Busy("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(ApiError::locked("x").status_code(), StatusCode::CONFLICT);
        assert_eq!(
            ApiError::AuthRequired("x".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn error_codes_are_distinct() {
        assert_eq!(ApiError::locked("a").error_code(), "LOCKED");
        assert_eq!(ApiError::Busy("a".into()).error_code(), "BUSY");
        assert_eq!(
            ApiError::IncompatibleOs("a".into()).error_code(),
            "INCOMPATIBLE_OS"
        );
    }

    #[test]
    fn auth_errors_become_401() {
        let err: ApiError = AuthError::TokenExpired.into();
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
    }
}
