use std::sync::Arc;

use axum::{Json, body::Bytes, extract::State, response::IntoResponse};

use super::optional_json;
use crate::auth::RequireInteractive;
use crate::server::AppState;
use crate::server::dto::{RevokeSessionRequest, RevokedCount, SessionListRequest};
use crate::server::response::{ApiError, ApiResponse};

/// Lists live sessions. POST is accepted so the refresh token can travel in the body.
pub async fn list(
    RequireInteractive(ctx): RequireInteractive,
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> impl IntoResponse {
    let req: SessionListRequest = optional_json(&body)?;
    let sessions = state.auth.list_sessions(
        ctx.user.id,
        ctx.session_id(),
        req.refresh_token.as_deref(),
    )?;
    Ok::<_, ApiError>(Json(ApiResponse::success(sessions)))
}

pub async fn revoke(
    RequireInteractive(ctx): RequireInteractive,
    State(state): State<Arc<AppState>>,
    Json(req): Json<RevokeSessionRequest>,
) -> impl IntoResponse {
    state
        .auth
        .revoke_session(&ctx.user, req.session_id, &ctx.actor())?;
    Ok::<_, ApiError>(Json(ApiResponse::success(RevokedCount { revoked: 1 })))
}

pub async fn revoke_others(
    RequireInteractive(ctx): RequireInteractive,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let revoked = state
        .auth
        .revoke_other_sessions(&ctx.user, ctx.session_id(), &ctx.actor())?;
    Ok::<_, ApiError>(Json(ApiResponse::success(RevokedCount { revoked })))
}
