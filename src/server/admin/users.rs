use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};

use super::require_admin;
use crate::audit::AuditEvent;
use crate::auth::{RequireAuth, hash_password, validate_password};
use crate::server::AppState;
use crate::server::dto::{AssignRoleRequest, CreateUserRequest, UserView};
use crate::server::response::{ApiError, ApiResponse, StoreOptionExt, StoreResultExt};
use crate::server::validation::{validate_email, validate_username};
use crate::types::{AuditEventType, Permission, User};

pub(super) fn user_view(state: &AppState, user: User) -> Result<UserView, ApiError> {
    let roles = state
        .store
        .list_user_roles(user.id)
        .api_err("Failed to list user roles")?;
    Ok(UserView { user, roles })
}

fn load_user(state: &AppState, id: i64) -> Result<User, ApiError> {
    state
        .store
        .get_user(id)
        .api_err("Failed to load user")?
        .or_not_found("User not found")
}

pub async fn list_users(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    require_admin(&state, &ctx, Permission::AdminUsersRead)?;
    let users = state.store.list_users().api_err("Failed to list users")?;
    let views = users
        .into_iter()
        .map(|u| user_view(&state, u))
        .collect::<Result<Vec<_>, _>>()?;
    Ok::<_, ApiError>(Json(ApiResponse::success(views)))
}

pub async fn create_user(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateUserRequest>,
) -> impl IntoResponse {
    require_admin(&state, &ctx, Permission::AdminUsersWrite)?;
    validate_username(&req.username)?;
    validate_email(&req.email)?;
    validate_password(&req.password)?;

    for role_id in &req.role_ids {
        if state
            .store
            .get_role(*role_id)
            .api_err("Failed to load role")?
            .is_none()
        {
            return Err(ApiError::bad_request(format!("Role {role_id} does not exist")));
        }
    }

    let hash = hash_password(&req.password)?;
    let user = state
        .store
        .create_user(&req.username, &req.email, &hash)
        .api_err("Failed to create user")?;
    for role_id in &req.role_ids {
        state
            .store
            .assign_role(user.id, *role_id)
            .api_err("Failed to assign role")?;
    }

    state.audit.record(
        AuditEvent::new(AuditEventType::UserCreated, &ctx.actor())
            .target("user", Some(user.id), user.username.as_str())
            .metadata(serde_json::json!({ "role_ids": req.role_ids })),
    );

    let view = user_view(&state, user)?;
    Ok::<_, ApiError>((StatusCode::CREATED, Json(ApiResponse::success(view))))
}

pub async fn get_user(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    require_admin(&state, &ctx, Permission::AdminUsersRead)?;
    let user = load_user(&state, id)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(user_view(&state, user)?)))
}

pub async fn delete_user(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    require_admin(&state, &ctx, Permission::AdminUsersWrite)?;
    if id == ctx.user.id {
        return Err(ApiError::bad_request("Cannot delete your own account"));
    }
    let user = load_user(&state, id)?;

    // Outstanding access tokens die with their sessions.
    state
        .auth
        .revoke_other_sessions(&user, None, &ctx.actor())?;
    state
        .store
        .delete_user(user.id)
        .api_err("Failed to delete user")?;

    state.audit.record(
        AuditEvent::new(AuditEventType::UserDeleted, &ctx.actor())
            .target("user", Some(user.id), user.username.as_str()),
    );
    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}

pub async fn assign_role(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<AssignRoleRequest>,
) -> impl IntoResponse {
    require_admin(&state, &ctx, Permission::AdminUsersWrite)?;
    let user = load_user(&state, id)?;
    let role = state
        .store
        .get_role(req.role_id)
        .api_err("Failed to load role")?
        .or_not_found("Role not found")?;

    let assigned = state
        .store
        .assign_role(user.id, role.id)
        .api_err("Failed to assign role")?;
    if assigned {
        state.audit.record(
            AuditEvent::new(AuditEventType::UserRoleAssigned, &ctx.actor())
                .target("user", Some(user.id), user.username.as_str())
                .metadata(serde_json::json!({ "role_id": role.id, "role": role.name })),
        );
    }

    Ok::<_, ApiError>(Json(ApiResponse::success(user_view(&state, user)?)))
}

pub async fn revoke_role(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path((id, role_id)): Path<(i64, i64)>,
) -> impl IntoResponse {
    require_admin(&state, &ctx, Permission::AdminUsersWrite)?;
    let user = load_user(&state, id)?;

    let revoked = state
        .store
        .revoke_role(user.id, role_id)
        .api_err("Failed to revoke role")?;
    if !revoked {
        return Err(ApiError::not_found("Role assignment not found"));
    }

    state.audit.record(
        AuditEvent::new(AuditEventType::UserRoleRevoked, &ctx.actor())
            .target("user", Some(user.id), user.username.as_str())
            .metadata(serde_json::json!({ "role_id": role_id })),
    );
    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}
