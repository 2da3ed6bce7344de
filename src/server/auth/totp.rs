use std::sync::Arc;

use axum::{Json, extract::State, response::IntoResponse};
use serde_json::json;

use crate::auth::RequireInteractive;
use crate::server::AppState;
use crate::server::dto::{TotpCodeRequest, TotpDisableRequest};
use crate::server::response::{ApiError, ApiResponse};

pub async fn setup(
    RequireInteractive(ctx): RequireInteractive,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let setup = state.auth.totp_setup(&ctx.user, &ctx.actor())?;
    Ok::<_, ApiError>(Json(ApiResponse::success(setup)))
}

pub async fn enable(
    RequireInteractive(ctx): RequireInteractive,
    State(state): State<Arc<AppState>>,
    Json(req): Json<TotpCodeRequest>,
) -> impl IntoResponse {
    state.auth.totp_enable(&ctx.user, &req.code, &ctx.actor())?;
    Ok::<_, ApiError>(Json(ApiResponse::success(json!({ "enabled": true }))))
}

pub async fn disable(
    RequireInteractive(ctx): RequireInteractive,
    State(state): State<Arc<AppState>>,
    Json(req): Json<TotpDisableRequest>,
) -> impl IntoResponse {
    state
        .auth
        .totp_disable(&ctx.user, &req.code, &req.password, &ctx.actor())?;
    Ok::<_, ApiError>(Json(ApiResponse::success(json!({ "enabled": false }))))
}

pub async fn status(
    RequireInteractive(ctx): RequireInteractive,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let status = state.auth.totp_status(ctx.user.id)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(status)))
}
