use std::sync::Arc;

use axum::{Json, extract::State, response::IntoResponse};

use crate::auth::{RequireAuth, RequireInteractive};
use crate::server::AppState;
use crate::server::dto::{ChangeEmailRequest, ChangePasswordRequest, ProfileResponse};
use crate::server::response::{ApiError, ApiResponse, StoreResultExt};
use crate::server::validation::validate_email;
use crate::types::Permission;

pub async fn get_profile(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let roles = state
        .store
        .list_user_roles(ctx.user.id)
        .api_err("Failed to list roles")?;
    let is_admin = roles.iter().any(|r| r.is_admin);

    let mut permissions = Vec::new();
    for permission in Permission::ALL {
        if state
            .rbac
            .has_permission_by_name(ctx.user.id, *permission)
            .api_err("Failed to resolve permissions")?
        {
            permissions.push(permission.name());
        }
    }

    Ok::<_, ApiError>(Json(ApiResponse::success(ProfileResponse {
        user: ctx.user,
        roles,
        is_admin,
        permissions,
    })))
}

pub async fn change_password(
    RequireInteractive(ctx): RequireInteractive,
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChangePasswordRequest>,
) -> impl IntoResponse {
    state.auth.change_password(
        &ctx.user,
        &req.current_password,
        &req.new_password,
        &ctx.actor(),
    )?;
    Ok::<_, ApiError>(Json(ApiResponse::success(serde_json::json!({ "changed": true }))))
}

pub async fn change_email(
    RequireInteractive(ctx): RequireInteractive,
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChangeEmailRequest>,
) -> impl IntoResponse {
    let email = req.email.trim();
    validate_email(email)?;
    state.auth.change_email(&ctx.user, email, &ctx.actor())?;
    Ok::<_, ApiError>(Json(ApiResponse::success(serde_json::json!({
        "email": email,
        "verified": false,
    }))))
}
