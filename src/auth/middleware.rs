use std::sync::Arc;

use axum::{
    Json,
    extract::FromRequestParts,
    http::{HeaderValue, Method, StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use serde_json::json;
use subtle::ConstantTimeEq;

use super::helpers::{
    CSRF_COOKIE, CSRF_HEADER, SESSION_COOKIE, client_ip, cookie, extract_bearer, query_token,
    user_agent,
};
use super::jwt::Claims;
use super::service::AuthError as ServiceError;
use super::token::is_api_key;
use crate::audit::Actor;
use crate::rbac::Subject;
use crate::server::AppState;
use crate::server::rate_limit::Bucket;
use crate::types::{ApiKey, ApiKeyScope, User};

/// How the request proved who it is.
#[derive(Debug, Clone)]
pub enum Credential {
    Session { session_id: i64 },
    Jwt { claims: Claims, session_id: Option<i64> },
    ApiKey { key: ApiKey, scopes: Vec<ApiKeyScope> },
}

/// The authenticated caller, attached to every protected handler.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user: User,
    pub credential: Credential,
    pub ip: String,
    pub user_agent: String,
}

impl AuthContext {
    #[must_use]
    pub fn subject(&self) -> Subject {
        Subject {
            user_id: self.user.id,
            key_scopes: match &self.credential {
                Credential::ApiKey { scopes, .. } => Some(scopes.clone()),
                _ => None,
            },
        }
    }

    #[must_use]
    pub fn session_id(&self) -> Option<i64> {
        match &self.credential {
            Credential::Session { session_id } => Some(*session_id),
            Credential::Jwt { session_id, .. } => *session_id,
            Credential::ApiKey { .. } => None,
        }
    }

    #[must_use]
    pub fn is_api_key(&self) -> bool {
        matches!(self.credential, Credential::ApiKey { .. })
    }

    #[must_use]
    pub fn actor(&self) -> Actor {
        Actor {
            user_id: Some(self.user.id),
            username: self.user.username.clone(),
            ip: self.ip.clone(),
            user_agent: self.user_agent.clone(),
            session_id: self.session_id(),
        }
    }
}

/// Extractor that requires any valid credential.
pub struct RequireAuth(pub AuthContext);

/// Extractor that requires a human credential (session cookie or JWT).
pub struct RequireInteractive(pub AuthContext);

/// Extractor for the pending-TOTP bearer issued by a password login. Holds the raw token.
pub struct TotpPending(pub String);

/// Client address and user agent, for unauthenticated routes.
pub struct ClientInfo(pub Actor);

#[derive(Debug)]
pub enum AuthRejection {
    MissingAuth,
    InvalidScheme,
    InvalidToken,
    ExpiredToken,
    EmailNotVerified,
    CsrfMismatch,
    ApiKeyNotAllowed,
    RateLimited,
    InternalError,
}

impl AuthRejection {
    fn parts(&self) -> (StatusCode, &'static str, &'static str) {
        match self {
            AuthRejection::MissingAuth => {
                (StatusCode::UNAUTHORIZED, "unauthorized", "Authentication required")
            }
            AuthRejection::InvalidScheme => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "Invalid authorization scheme",
            ),
            AuthRejection::InvalidToken => {
                (StatusCode::UNAUTHORIZED, "invalid_token", "Invalid token")
            }
            AuthRejection::ExpiredToken => {
                (StatusCode::UNAUTHORIZED, "expired_token", "Token expired")
            }
            AuthRejection::EmailNotVerified => (
                StatusCode::FORBIDDEN,
                "email_not_verified",
                "Email address has not been verified",
            ),
            AuthRejection::CsrfMismatch => {
                (StatusCode::FORBIDDEN, "csrf_token_mismatch", "CSRF token missing or invalid")
            }
            AuthRejection::ApiKeyNotAllowed => (
                StatusCode::FORBIDDEN,
                "forbidden",
                "API keys cannot be used for this operation",
            ),
            AuthRejection::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "Too many requests, slow down",
            ),
            AuthRejection::InternalError => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Internal server error",
            ),
        }
    }
}

impl From<ServiceError> for AuthRejection {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::ExpiredToken => AuthRejection::ExpiredToken,
            ServiceError::EmailNotVerified => AuthRejection::EmailNotVerified,
            ServiceError::Internal(e) => {
                tracing::error!("Authentication failed internally: {e}");
                AuthRejection::InternalError
            }
            _ => AuthRejection::InvalidToken,
        }
    }
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        let body = json!({ "success": false, "error": code, "message": message });

        let mut response = (status, Json(body)).into_response();

        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                "WWW-Authenticate",
                HeaderValue::from_static("Bearer realm=\"berth\""),
            );
        }

        response
    }
}

impl FromRequestParts<Arc<AppState>> for RequireAuth {
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        if let Some(ctx) = parts.extensions.get::<AuthContext>() {
            return Ok(RequireAuth(ctx.clone()));
        }

        let ctx = authenticate(parts, state)?;
        if !state
            .limits
            .check(Bucket::Authenticated, &format!("user:{}", ctx.user.id))
        {
            return Err(AuthRejection::RateLimited);
        }
        parts.extensions.insert(ctx.clone());
        Ok(RequireAuth(ctx))
    }
}

impl FromRequestParts<Arc<AppState>> for RequireInteractive {
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let RequireAuth(ctx) = RequireAuth::from_request_parts(parts, state).await?;

        if ctx.is_api_key() {
            return Err(AuthRejection::ApiKeyNotAllowed);
        }

        Ok(RequireInteractive(ctx))
    }
}

impl FromRequestParts<Arc<AppState>> for TotpPending {
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = extract_bearer(&parts.headers)
            .map_err(|()| AuthRejection::InvalidScheme)?
            .ok_or(AuthRejection::MissingAuth)?;

        state.auth.authenticate_totp_pending(&token)?;
        Ok(TotpPending(token))
    }
}

impl<S: Send + Sync> FromRequestParts<S> for ClientInfo {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(ClientInfo(Actor::anonymous(
            client_ip(parts),
            user_agent(&parts.headers),
        )))
    }
}

fn authenticate(parts: &Parts, state: &Arc<AppState>) -> Result<AuthContext, AuthRejection> {
    let ip = client_ip(parts);
    let agent = user_agent(&parts.headers);

    let bearer = extract_bearer(&parts.headers)
        .map_err(|()| AuthRejection::InvalidScheme)?
        .or_else(|| query_token(parts));

    if let Some(token) = bearer {
        return if is_api_key(&token) {
            let key = state.auth.authenticate_api_key(&token)?;
            Ok(AuthContext {
                user: key.user,
                credential: Credential::ApiKey {
                    key: key.key,
                    scopes: key.scopes,
                },
                ip,
                user_agent: agent,
            })
        } else {
            let access = state.auth.authenticate_access(&token)?;
            Ok(AuthContext {
                user: access.user,
                credential: Credential::Jwt {
                    claims: access.claims,
                    session_id: access.session_id,
                },
                ip,
                user_agent: agent,
            })
        };
    }

    let raw = cookie(&parts.headers, SESSION_COOKIE).ok_or(AuthRejection::MissingAuth)?;
    let (user, session) = state.auth.authenticate_cookie(&raw)?;

    if state.config.session.csrf_enabled && !is_safe_method(&parts.method) {
        check_csrf(parts)?;
    }

    Ok(AuthContext {
        user,
        credential: Credential::Session {
            session_id: session.id,
        },
        ip,
        user_agent: agent,
    })
}

fn is_safe_method(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

/// Double-submit check: the CSRF cookie must be echoed in the header.
fn check_csrf(parts: &Parts) -> Result<(), AuthRejection> {
    let expected = cookie(&parts.headers, CSRF_COOKIE).ok_or(AuthRejection::CsrfMismatch)?;
    let presented = parts
        .headers
        .get(CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthRejection::CsrfMismatch)?;

    if expected.is_empty() || !bool::from(expected.as_bytes().ct_eq(presented.as_bytes())) {
        return Err(AuthRejection::CsrfMismatch);
    }
    Ok(())
}
