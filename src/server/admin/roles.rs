use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde_json::json;

use super::require_admin;
use crate::audit::AuditEvent;
use crate::auth::RequireAuth;
use crate::rbac::validate_pattern;
use crate::server::AppState;
use crate::server::dto::{
    CreateRoleRequest, RolePermissionRequest, RoleView, StackPermissionRequest, UpdateRoleRequest,
};
use crate::server::response::{ApiError, ApiResponse, StoreOptionExt, StoreResultExt};
use crate::server::validation::validate_role_name;
use crate::store::ADMIN_ROLE_NAME;
use crate::types::{AuditEventType, Permission, PermissionRecord, PermissionScope, Role};

pub(super) fn role_view(state: &AppState, role: Role) -> Result<RoleView, ApiError> {
    let permissions = state
        .store
        .list_role_permissions(role.id)
        .api_err("Failed to list role permissions")?;
    let stack_permissions = state
        .store
        .list_role_stack_permissions(role.id)
        .api_err("Failed to list stack permissions")?;
    Ok(RoleView {
        role,
        permissions,
        stack_permissions,
    })
}

fn load_role(state: &AppState, id: i64) -> Result<Role, ApiError> {
    state
        .store
        .get_role(id)
        .api_err("Failed to load role")?
        .or_not_found("Role not found")
}

/// Resolves a permission name to its stored row, requiring the given scope.
fn scoped_permission(
    state: &AppState,
    name: &str,
    scope: PermissionScope,
) -> Result<PermissionRecord, ApiError> {
    let permission = Permission::parse(name)
        .ok_or_else(|| ApiError::bad_request(format!("Unknown permission '{name}'")))?;
    if permission.scope() != scope {
        let expected = match scope {
            PermissionScope::Admin => "an admin",
            PermissionScope::User => "a user",
        };
        return Err(ApiError::bad_request(format!(
            "'{name}' is not {expected}-scope permission"
        )));
    }
    state
        .store
        .get_permission_by_name(permission.name())
        .api_err("Failed to load permission")?
        .or_not_found("Permission not found")
}

pub async fn list_roles(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    require_admin(&state, &ctx, Permission::AdminRolesRead)?;
    let roles = state.store.list_roles().api_err("Failed to list roles")?;
    Ok::<_, ApiError>(Json(ApiResponse::success(roles)))
}

pub async fn create_role(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateRoleRequest>,
) -> impl IntoResponse {
    require_admin(&state, &ctx, Permission::AdminRolesWrite)?;
    validate_role_name(&req.name)?;

    let role = state
        .store
        .create_role(&req.name, &req.description, req.is_admin)
        .api_err("Failed to create role")?;

    state.audit.record(
        AuditEvent::new(AuditEventType::RoleCreated, &ctx.actor())
            .target("role", Some(role.id), role.name.as_str())
            .metadata(json!({ "is_admin": role.is_admin })),
    );
    Ok::<_, ApiError>((StatusCode::CREATED, Json(ApiResponse::success(role))))
}

pub async fn get_role(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    require_admin(&state, &ctx, Permission::AdminRolesRead)?;
    let role = load_role(&state, id)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(role_view(&state, role)?)))
}

pub async fn update_role(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateRoleRequest>,
) -> impl IntoResponse {
    require_admin(&state, &ctx, Permission::AdminRolesWrite)?;
    let mut role = load_role(&state, id)?;

    if let Some(name) = req.name {
        if role.name == ADMIN_ROLE_NAME && name != ADMIN_ROLE_NAME {
            return Err(ApiError::bad_request("The admin role cannot be renamed"));
        }
        validate_role_name(&name)?;
        role.name = name;
    }
    if let Some(description) = req.description {
        role.description = description;
    }

    state
        .store
        .update_role(role.id, &role.name, &role.description)
        .api_err("Failed to update role")?;

    state.audit.record(
        AuditEvent::new(AuditEventType::RoleUpdated, &ctx.actor())
            .target("role", Some(role.id), role.name.as_str()),
    );
    Ok::<_, ApiError>(Json(ApiResponse::success(role)))
}

pub async fn delete_role(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    require_admin(&state, &ctx, Permission::AdminRolesWrite)?;
    let role = load_role(&state, id)?;
    if role.name == ADMIN_ROLE_NAME {
        return Err(ApiError::bad_request("The admin role cannot be deleted"));
    }

    state
        .store
        .delete_role(role.id)
        .api_err("Failed to delete role")?;

    state.audit.record(
        AuditEvent::new(AuditEventType::RoleDeleted, &ctx.actor())
            .target("role", Some(role.id), role.name.as_str()),
    );
    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}

pub async fn list_permissions(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    require_admin(&state, &ctx, Permission::AdminPermissionsRead)?;
    let permissions = state
        .store
        .list_permissions()
        .api_err("Failed to list permissions")?;
    Ok::<_, ApiError>(Json(ApiResponse::success(permissions)))
}

pub async fn list_role_permissions(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    require_admin(&state, &ctx, Permission::AdminRolesRead)?;
    let role = load_role(&state, id)?;
    let permissions = state
        .store
        .list_role_permissions(role.id)
        .api_err("Failed to list role permissions")?;
    Ok::<_, ApiError>(Json(ApiResponse::success(permissions)))
}

/// Grants an admin-scope permission globally. User-scope grants go through stack permissions.
pub async fn add_role_permission(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<RolePermissionRequest>,
) -> impl IntoResponse {
    require_admin(&state, &ctx, Permission::AdminRolesWrite)?;
    let role = load_role(&state, id)?;
    let permission = scoped_permission(&state, &req.permission, PermissionScope::Admin)?;

    let added = state
        .store
        .add_role_permission(role.id, permission.id)
        .api_err("Failed to add permission")?;
    if added {
        state.audit.record(
            AuditEvent::new(AuditEventType::PermissionAdded, &ctx.actor())
                .target("role", Some(role.id), role.name.as_str())
                .metadata(json!({ "permission": permission.name })),
        );
    }
    Ok::<_, ApiError>(Json(ApiResponse::success(role_view(&state, role)?)))
}

pub async fn remove_role_permission(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path((id, permission)): Path<(i64, String)>,
) -> impl IntoResponse {
    require_admin(&state, &ctx, Permission::AdminRolesWrite)?;
    let role = load_role(&state, id)?;
    let record = scoped_permission(&state, &permission, PermissionScope::Admin)?;

    let removed = state
        .store
        .remove_role_permission(role.id, record.id)
        .api_err("Failed to remove permission")?;
    if !removed {
        return Err(ApiError::not_found("Role does not hold this permission"));
    }

    state.audit.record(
        AuditEvent::new(AuditEventType::PermissionRemoved, &ctx.actor())
            .target("role", Some(role.id), role.name.as_str())
            .metadata(json!({ "permission": record.name })),
    );
    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}

pub async fn list_stack_permissions(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    require_admin(&state, &ctx, Permission::AdminRolesRead)?;
    let role = load_role(&state, id)?;
    let grants = state
        .store
        .list_role_stack_permissions(role.id)
        .api_err("Failed to list stack permissions")?;
    Ok::<_, ApiError>(Json(ApiResponse::success(grants)))
}

/// Grants a user-scope permission on every stack of a server matching the pattern.
pub async fn add_stack_permission(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<StackPermissionRequest>,
) -> impl IntoResponse {
    require_admin(&state, &ctx, Permission::AdminRolesWrite)?;
    let role = load_role(&state, id)?;
    validate_pattern(&req.stack_pattern)?;
    let permission = scoped_permission(&state, &req.permission, PermissionScope::User)?;
    let server = state
        .store
        .get_server(req.server_id)
        .api_err("Failed to load server")?
        .or_not_found("Server not found")?;

    let grant = state
        .store
        .add_stack_permission(server.id, role.id, permission.id, &req.stack_pattern)
        .api_err("Failed to add stack permission")?;

    state.audit.record(
        AuditEvent::new(AuditEventType::PermissionAdded, &ctx.actor())
            .target("role", Some(role.id), role.name.as_str())
            .server(server.id)
            .metadata(json!({
                "permission": grant.permission,
                "stack_pattern": grant.stack_pattern,
            })),
    );
    Ok::<_, ApiError>((StatusCode::CREATED, Json(ApiResponse::success(grant))))
}

pub async fn delete_stack_permission(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path((id, grant_id)): Path<(i64, i64)>,
) -> impl IntoResponse {
    require_admin(&state, &ctx, Permission::AdminRolesWrite)?;
    let role = load_role(&state, id)?;

    let deleted = state
        .store
        .delete_stack_permission(role.id, grant_id)
        .api_err("Failed to delete stack permission")?;
    if !deleted {
        return Err(ApiError::not_found("Stack permission not found"));
    }

    state.audit.record(
        AuditEvent::new(AuditEventType::PermissionRemoved, &ctx.actor())
            .target("role", Some(role.id), role.name.as_str())
            .metadata(json!({ "stack_permission_id": grant_id })),
    );
    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}
