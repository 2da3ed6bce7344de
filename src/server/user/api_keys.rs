use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{Duration, Utc};
use serde_json::json;

use super::access::visible_server;
use crate::audit::AuditEvent;
use crate::auth::{AuthContext, RequireAuth, RequireInteractive};
use crate::rbac::validate_pattern;
use crate::server::AppState;
use crate::server::dto::{ApiKeyView, CreateApiKeyRequest, CreatedApiKey, ScopeRequest};
use crate::server::response::{ApiError, ApiResponse, StoreOptionExt, StoreResultExt};
use crate::server::validation::validate_api_key_name;
use crate::types::{ApiKey, ApiKeyScope, AuditEventType, Permission};

/// Loads a key owned by the caller. Other users' keys are reported missing.
fn owned_key(state: &AppState, ctx: &AuthContext, id: i64) -> Result<ApiKey, ApiError> {
    state
        .store
        .get_api_key(id)
        .api_err("Failed to load API key")?
        .filter(|k| k.user_id == ctx.user.id)
        .or_not_found("API key not found")
}

fn add_scope_row(
    state: &AppState,
    ctx: &AuthContext,
    key_id: i64,
    req: &ScopeRequest,
) -> Result<ApiKeyScope, ApiError> {
    let permission = Permission::parse(&req.permission).ok_or_else(|| {
        ApiError::bad_request(format!("Unknown permission '{}'", req.permission))
    })?;
    validate_pattern(&req.stack_pattern)?;
    if let Some(server_id) = req.server_id {
        visible_server(state, ctx, server_id)?;
    }

    let record = state
        .store
        .get_permission_by_name(permission.name())
        .api_err("Failed to load permission")?
        .or_not_found("Permission not found")?;
    state
        .store
        .add_api_key_scope(key_id, record.id, req.server_id, &req.stack_pattern)
        .api_err("Failed to add scope")
}

pub async fn list_keys(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let keys = state
        .store
        .list_user_api_keys(ctx.user.id)
        .api_err("Failed to list API keys")?;

    let mut views = Vec::with_capacity(keys.len());
    for key in keys {
        let scopes = state
            .store
            .list_api_key_scopes(key.id)
            .api_err("Failed to list scopes")?;
        views.push(ApiKeyView { key, scopes });
    }
    Ok::<_, ApiError>(Json(ApiResponse::success(views)))
}

/// Mints a key. The raw value appears only in this response.
pub async fn create_key(
    RequireInteractive(ctx): RequireInteractive,
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateApiKeyRequest>,
) -> impl IntoResponse {
    validate_api_key_name(&req.name)?;
    let expires_at = match req.expires_in_days {
        Some(days) if days <= 0 => {
            return Err(ApiError::bad_request("expires_in_days must be positive"));
        }
        Some(days) => Some(Utc::now() + Duration::days(days)),
        None => None,
    };
    // Reject bad scopes before anything is written.
    for scope in &req.scopes {
        if Permission::parse(&scope.permission).is_none() {
            return Err(ApiError::bad_request(format!(
                "Unknown permission '{}'",
                scope.permission
            )));
        }
        validate_pattern(&scope.stack_pattern)?;
    }

    let (raw, prefix, hash) = state.auth.api_keys().generate()?;
    let key = state
        .store
        .create_api_key(ctx.user.id, &req.name, &prefix, &hash, expires_at)
        .api_err("Failed to create API key")?;

    let mut scopes = Vec::with_capacity(req.scopes.len());
    for scope in &req.scopes {
        match add_scope_row(&state, &ctx, key.id, scope) {
            Ok(row) => scopes.push(row),
            Err(e) => {
                let _ = state.store.delete_api_key(key.id);
                return Err(e);
            }
        }
    }

    state.audit.record(
        AuditEvent::new(AuditEventType::ApiTokenIssued, &ctx.actor())
            .target("api_key", Some(key.id), key.name.as_str())
            .metadata(json!({
                "prefix": key.prefix,
                "scopes": scopes.iter().map(|s| s.permission.as_str()).collect::<Vec<_>>(),
            })),
    );

    Ok::<_, ApiError>((
        StatusCode::CREATED,
        Json(ApiResponse::success(CreatedApiKey {
            key: raw,
            view: ApiKeyView { key, scopes },
        })),
    ))
}

pub async fn get_key(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let key = owned_key(&state, &ctx, id)?;
    let scopes = state
        .store
        .list_api_key_scopes(key.id)
        .api_err("Failed to list scopes")?;
    Ok::<_, ApiError>(Json(ApiResponse::success(ApiKeyView { key, scopes })))
}

pub async fn delete_key(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let key = owned_key(&state, &ctx, id)?;
    state
        .store
        .delete_api_key(key.id)
        .api_err("Failed to delete API key")?;

    state.audit.record(
        AuditEvent::new(AuditEventType::ApiTokenRevoked, &ctx.actor())
            .target("api_key", Some(key.id), key.name.as_str())
            .metadata(json!({ "prefix": key.prefix })),
    );
    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}

pub async fn list_scopes(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let key = owned_key(&state, &ctx, id)?;
    let scopes = state
        .store
        .list_api_key_scopes(key.id)
        .api_err("Failed to list scopes")?;
    Ok::<_, ApiError>(Json(ApiResponse::success(scopes)))
}

pub async fn add_scope(
    RequireInteractive(ctx): RequireInteractive,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<ScopeRequest>,
) -> impl IntoResponse {
    let key = owned_key(&state, &ctx, id)?;
    let scope = add_scope_row(&state, &ctx, key.id, &req)?;
    Ok::<_, ApiError>((StatusCode::CREATED, Json(ApiResponse::success(scope))))
}

pub async fn remove_scope(
    RequireInteractive(ctx): RequireInteractive,
    State(state): State<Arc<AppState>>,
    Path((id, scope_id)): Path<(i64, i64)>,
) -> impl IntoResponse {
    let key = owned_key(&state, &ctx, id)?;
    let deleted = state
        .store
        .delete_api_key_scope(key.id, scope_id)
        .api_err("Failed to remove scope")?;
    if !deleted {
        return Err(ApiError::not_found("Scope not found"));
    }
    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}
