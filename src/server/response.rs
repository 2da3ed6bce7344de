use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::auth::AuthError;
use crate::error::{Error, Result as StoreResult};
use crate::rbac::Access;

/// Standard API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    #[must_use]
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

/// Limit/offset window for list endpoints.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PageParams {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

impl PageParams {
    /// Clamps the window to sane bounds.
    #[must_use]
    pub fn window(self) -> (i64, i64) {
        (self.limit.clamp(1, MAX_PAGE_SIZE), self.offset.max(0))
    }
}

fn default_limit() -> i64 {
    DEFAULT_PAGE_SIZE
}

pub const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 500;

/// API error that converts to a `{success:false, error, message}` body.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    #[must_use]
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_error", message)
    }

    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "conflict", message)
    }

    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", message)
    }

    #[must_use]
    pub fn insufficient_scope() -> Self {
        Self::new(
            StatusCode::FORBIDDEN,
            "insufficient_scope",
            "API key scope does not cover this action",
        )
    }

    #[must_use]
    pub fn too_many_requests() -> Self {
        Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited",
            "Too many requests, slow down",
        )
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }

    /// Maps a denied RBAC decision to the matching 403.
    #[must_use]
    pub fn denied(access: Access) -> Self {
        match access {
            Access::OutOfScope => Self::insufficient_scope(),
            _ => Self::forbidden("Insufficient permissions"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({ "success": false, "error": self.code, "message": self.message });
        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match e {
            Error::BadRequest(msg) | Error::Compose(msg) | Error::InvalidPermission(msg) => {
                Self::bad_request(msg)
            }
            Error::NotFound => Self::not_found("Not found"),
            Error::AlreadyExists => Self::conflict("Already exists"),
            Error::Conflict(msg) => Self::conflict(msg),
            Error::Forbidden => Self::forbidden("Insufficient permissions"),
            Error::Unauthorized | Error::InvalidTokenFormat | Error::TokenExpired => {
                Self::unauthorized("Authentication required")
            }
            Error::UpstreamTimeout => Self::new(
                StatusCode::GATEWAY_TIMEOUT,
                "upstream_timeout",
                "Agent did not respond in time",
            ),
            Error::Agent(msg) => {
                tracing::warn!("Agent call failed: {msg}");
                Self::new(StatusCode::BAD_GATEWAY, "agent_error", msg)
            }
            Error::AgentStatus { status, message } => {
                let code = if status == 404 { "not_found" } else { "agent_error" };
                let http = if status == 404 {
                    StatusCode::NOT_FOUND
                } else {
                    StatusCode::BAD_GATEWAY
                };
                Self::new(http, code, format!("agent returned {status}: {message}"))
            }
            other => {
                tracing::error!("Request failed: {other}");
                Self::internal("Internal server error")
            }
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        let code = e.code();
        match e {
            AuthError::InvalidCredentials => {
                Self::new(StatusCode::UNAUTHORIZED, code, "Invalid username or password")
            }
            AuthError::EmailNotVerified => Self::new(
                StatusCode::FORBIDDEN,
                code,
                "Email address has not been verified",
            ),
            AuthError::InvalidToken => Self::new(StatusCode::UNAUTHORIZED, code, "Invalid token"),
            AuthError::ExpiredToken => Self::new(StatusCode::UNAUTHORIZED, code, "Token expired"),
            AuthError::InvalidTotpCode => {
                Self::new(StatusCode::UNAUTHORIZED, code, "Invalid two-factor code")
            }
            AuthError::TotpNotEnabled => Self::new(
                StatusCode::BAD_REQUEST,
                code,
                "Two-factor authentication is not set up",
            ),
            AuthError::TotpAlreadyEnabled => Self::new(
                StatusCode::CONFLICT,
                code,
                "Two-factor authentication is already enabled",
            ),
            AuthError::Validation(msg) => Self::new(StatusCode::BAD_REQUEST, code, msg),
            AuthError::NotFound => Self::new(StatusCode::NOT_FOUND, code, "Not found"),
            AuthError::Internal(e) => {
                tracing::error!("Authentication request failed: {e}");
                Self::internal("Internal server error")
            }
        }
    }
}

/// Extension trait for converting store results to API errors with a custom message.
pub trait StoreResultExt<T> {
    fn api_err(self, message: &'static str) -> Result<T, ApiError>;
}

impl<T> StoreResultExt<T> for StoreResult<T> {
    fn api_err(self, message: &'static str) -> Result<T, ApiError> {
        self.map_err(|e| match e {
            Error::AlreadyExists => ApiError::conflict("Already exists"),
            Error::Conflict(msg) => ApiError::conflict(msg),
            other => {
                tracing::error!("{message}: {other}");
                ApiError::internal(message)
            }
        })
    }
}

/// Extension for Option types from store operations.
pub trait StoreOptionExt<T> {
    fn or_not_found(self, message: &'static str) -> Result<T, ApiError>;
}

impl<T> StoreOptionExt<T> for Option<T> {
    fn or_not_found(self, message: &'static str) -> Result<T, ApiError> {
        self.ok_or_else(|| ApiError::not_found(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let e = ApiError::from(Error::Compose("service 'x' not found".into()));
        assert_eq!(e.status, StatusCode::BAD_REQUEST);
        assert_eq!(e.code, "validation_error");
        assert_eq!(e.message, "service 'x' not found");

        let e = ApiError::from(Error::UpstreamTimeout);
        assert_eq!(e.code, "upstream_timeout");

        let e = ApiError::from(Error::AgentStatus {
            status: 500,
            message: "boom".into(),
        });
        assert_eq!(e.status, StatusCode::BAD_GATEWAY);
        assert_eq!(e.code, "agent_error");

        let e = ApiError::from(Error::Crypto("bad key".into()));
        assert_eq!(e.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(e.message, "Internal server error");

        assert_eq!(ApiError::denied(Access::OutOfScope).code, "insufficient_scope");
        assert_eq!(ApiError::denied(Access::Denied).code, "forbidden");
        assert_eq!(ApiError::from(AuthError::InvalidToken).code, "invalid_token");
    }

    #[test]
    fn test_page_window_is_clamped() {
        let page = PageParams {
            limit: 10_000,
            offset: -3,
        };
        assert_eq!(page.window(), (500, 0));
    }

    #[test]
    fn test_api_err_keeps_conflicts() {
        let result: StoreResult<()> = Err(Error::AlreadyExists);
        let e = result.api_err("Failed to create role").unwrap_err();
        assert_eq!(e.status, StatusCode::CONFLICT);
    }
}
