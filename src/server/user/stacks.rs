use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use reqwest::Method;
use serde_json::{Value, json};

use super::access::{filter_stacks, server_client, stack_client, visible_server};
use crate::auth::RequireAuth;
use crate::compose::{self, ComposeDocument, ImageUpdateRequest, PatchRequest};
use crate::rbac::Target;
use crate::server::AppState;
use crate::server::dto::{CreateStackRequest, StackPermissions};
use crate::server::response::{ApiError, ApiResponse, StoreResultExt};
use crate::server::validation::validate_stack_name;
use crate::types::{Permission, PermissionScope};

pub async fn list_stacks(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(sid): Path<i64>,
) -> impl IntoResponse {
    let (server, client) = server_client(&state, &ctx, sid, Permission::StacksRead)?;
    let stacks = client.list_stacks().await?;
    let stacks = filter_stacks(&state, &ctx, server.id, stacks, Permission::StacksRead, |s| {
        s.name.as_str()
    })?;
    Ok::<_, ApiError>(Json(ApiResponse::success(stacks)))
}

pub async fn create_stack(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(sid): Path<i64>,
    Json(req): Json<CreateStackRequest>,
) -> impl IntoResponse {
    validate_stack_name(&req.name)?;
    let (server, client) = stack_client(&state, &ctx, sid, &req.name, Permission::StacksCreate)?;

    // Reject documents the compose engine could not later edit.
    let document = ComposeDocument::parse(&req.compose)?;
    document.validate()?;

    let created = client.create_stack(&req.name, &req.compose).await?;
    tracing::info!(server_id = server.id, stack = %req.name, user_id = ctx.user.id, "Stack created");
    Ok::<_, ApiError>((StatusCode::CREATED, Json(ApiResponse::success(created))))
}

pub async fn get_stack(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path((sid, name)): Path<(i64, String)>,
) -> impl IntoResponse {
    let (_, client) = stack_client(&state, &ctx, sid, &name, Permission::StacksRead)?;
    let stack = client.get_stack(&name).await?;
    Ok::<_, ApiError>(Json(ApiResponse::success(stack)))
}

pub async fn delete_stack(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path((sid, name)): Path<(i64, String)>,
) -> impl IntoResponse {
    let (server, client) = stack_client(&state, &ctx, sid, &name, Permission::StacksDelete)?;
    client.delete_stack(&name).await?;
    tracing::info!(server_id = server.id, stack = %name, user_id = ctx.user.id, "Stack deleted");
    Ok::<_, ApiError>(Json(ApiResponse::success(json!({ "deleted": name }))))
}

pub async fn get_compose(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path((sid, name)): Path<(i64, String)>,
) -> impl IntoResponse {
    let (_, client) = stack_client(&state, &ctx, sid, &name, Permission::StacksRead)?;
    let content = client.get_compose(&name).await?;
    Ok::<_, ApiError>(Json(ApiResponse::success(json!({ "content": content }))))
}

/// Applies (or previews) a structured patch to the stack's compose file.
pub async fn patch_compose(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path((sid, name)): Path<(i64, String)>,
    Json(req): Json<PatchRequest>,
) -> impl IntoResponse {
    let (_, client) = stack_client(&state, &ctx, sid, &name, Permission::StacksManage)?;
    let preview = compose::patch_stack(&client, &name, &req).await?;
    Ok::<_, ApiError>(Json(ApiResponse::success(preview)))
}

pub async fn update_images(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path((sid, name)): Path<(i64, String)>,
    Json(req): Json<ImageUpdateRequest>,
) -> impl IntoResponse {
    let (_, client) = stack_client(&state, &ctx, sid, &name, Permission::StacksManage)?;
    let preview = compose::update_images(&client, &name, &req).await?;
    Ok::<_, ApiError>(Json(ApiResponse::success(preview)))
}

pub async fn stack_stats(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path((sid, name)): Path<(i64, String)>,
) -> impl IntoResponse {
    let (_, client) = stack_client(&state, &ctx, sid, &name, Permission::StacksRead)?;
    let stats: Value = client
        .json(Method::GET, &format!("/stacks/{name}/stats"), None)
        .await?;
    Ok::<_, ApiError>(Json(ApiResponse::success(stats)))
}

/// The user-scope permissions the caller holds on this stack, for UI gating.
pub async fn stack_permissions(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path((sid, name)): Path<(i64, String)>,
) -> impl IntoResponse {
    validate_stack_name(&name)?;
    let server = visible_server(&state, &ctx, sid)?;
    let subject = ctx.subject();

    let mut permissions = Vec::new();
    for permission in Permission::ALL
        .iter()
        .filter(|p| p.scope() == PermissionScope::User)
    {
        let access = state
            .rbac
            .check(&subject, Target::Stack(server.id, &name), *permission)
            .api_err("Failed to check permissions")?;
        if access.is_granted() {
            permissions.push(permission.name());
        }
    }

    Ok::<_, ApiError>(Json(ApiResponse::success(StackPermissions {
        server_id: server.id,
        stack_name: name,
        permissions,
    })))
}
