use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::header::SET_COOKIE,
    response::{AppendHeaders, IntoResponse},
};
use chrono::Utc;
use rand::Rng;

use super::optional_json;
use crate::auth::helpers::{CSRF_COOKIE, SESSION_COOKIE, set_cookie};
use crate::auth::{AccessContext, ClientInfo, Credential, RequireInteractive, TotpPending};
use crate::server::AppState;
use crate::server::dto::{
    CookieSessionResponse, LoginRequest, LogoutRequest, LogoutResponse, RefreshRequest,
    TotpCodeRequest,
};
use crate::server::rate_limit::{LoginLimit, TotpLimit};
use crate::server::response::{ApiError, ApiResponse, StoreOptionExt, StoreResultExt};

pub async fn login(
    _limit: LoginLimit,
    ClientInfo(client): ClientInfo,
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> impl IntoResponse {
    let outcome = state.auth.login(&req.username, &req.password, &client)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(outcome)))
}

pub async fn refresh(
    ClientInfo(client): ClientInfo,
    State(state): State<Arc<AppState>>,
    Json(req): Json<RefreshRequest>,
) -> impl IntoResponse {
    let pair = state.auth.refresh(&req.refresh_token, &client)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(pair)))
}

pub async fn verify_totp(
    _limit: TotpLimit,
    TotpPending(token): TotpPending,
    ClientInfo(client): ClientInfo,
    State(state): State<Arc<AppState>>,
    Json(req): Json<TotpCodeRequest>,
) -> impl IntoResponse {
    let pair = state.auth.verify_totp_login(&token, &req.code, &client)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(pair)))
}

/// Ends the caller's credential: revokes a JWT pair or drops a cookie session.
pub async fn logout(
    RequireInteractive(ctx): RequireInteractive,
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> impl IntoResponse {
    let req: LogoutRequest = optional_json(&body)?;
    let actor = ctx.actor();

    let revoked = match ctx.credential {
        Credential::Jwt { claims, session_id } => {
            let access = AccessContext {
                user: ctx.user,
                claims,
                session_id,
            };
            state
                .auth
                .logout(&access, req.refresh_token.as_deref(), &actor)?
        }
        Credential::Session { session_id } => {
            state.auth.revoke_session(&ctx.user, session_id, &actor)?;
            vec!["session"]
        }
        Credential::ApiKey { .. } => {
            return Err(ApiError::forbidden("API keys cannot log out"));
        }
    };

    let secure = state.config.session.secure;
    let same_site = state.config.session.same_site.as_str();
    Ok::<_, ApiError>((
        AppendHeaders([
            (SET_COOKIE, set_cookie(SESSION_COOKIE, "", 0, true, secure, same_site)),
            (SET_COOKIE, set_cookie(CSRF_COOKIE, "", 0, false, secure, same_site)),
        ]),
        Json(ApiResponse::success(LogoutResponse {
            revoked_tokens: revoked,
        })),
    ))
}

/// Password login for browsers: sets an HttpOnly session cookie plus a CSRF cookie.
pub async fn create_session(
    _limit: LoginLimit,
    ClientInfo(client): ClientInfo,
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> impl IntoResponse {
    let (raw, session) = state
        .auth
        .create_cookie_session(&req.username, &req.password, &client)?;
    let user = state
        .store
        .get_user(session.user_id)
        .api_err("Failed to load user")?
        .or_not_found("User not found")?;

    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    let csrf_token = hex::encode(bytes);
    let max_age = u64::try_from((session.expires_at - Utc::now()).num_seconds()).unwrap_or(0);
    let secure = state.config.session.secure;
    let same_site = state.config.session.same_site.as_str();

    Ok::<_, ApiError>((
        AppendHeaders([
            (
                SET_COOKIE,
                set_cookie(SESSION_COOKIE, &raw, max_age, true, secure, same_site),
            ),
            (
                SET_COOKIE,
                set_cookie(CSRF_COOKIE, &csrf_token, max_age, false, secure, same_site),
            ),
        ]),
        Json(ApiResponse::success(CookieSessionResponse {
            user,
            csrf_token,
            expires_at: session.expires_at,
        })),
    ))
}
