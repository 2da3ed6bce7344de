//! Per-server registry credentials. Passwords are encrypted before they reach the store
//! and never leave it in responses.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;

use super::access::{require, visible_server};
use crate::auth::{AuthContext, RequireAuth};
use crate::images::normalize_registry_url;
use crate::rbac::{Target, validate_pattern};
use crate::server::AppState;
use crate::server::dto::{CreateRegistryRequest, UpdateRegistryRequest};
use crate::server::response::{ApiError, ApiResponse, StoreOptionExt, StoreResultExt};
use crate::store::NewRegistryCredential;
use crate::types::{Permission, Server};

fn managed_server(state: &AppState, ctx: &AuthContext, sid: i64) -> Result<Server, ApiError> {
    let server = visible_server(state, ctx, sid)?;
    require(state, ctx, Target::Server(server.id), Permission::RegistriesManage)?;
    Ok(server)
}

fn registry_host(url: &str) -> Result<String, ApiError> {
    let host = normalize_registry_url(url);
    if host.is_empty() {
        return Err(ApiError::bad_request("registry_url is required"));
    }
    Ok(host)
}

fn image_pattern(pattern: Option<String>) -> Option<String> {
    pattern.filter(|p| !p.trim().is_empty())
}

pub async fn list_registries(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(sid): Path<i64>,
) -> impl IntoResponse {
    let server = managed_server(&state, &ctx, sid)?;
    let credentials = state
        .store
        .list_registry_credentials(server.id)
        .api_err("Failed to list registry credentials")?;
    Ok::<_, ApiError>(Json(ApiResponse::success(credentials)))
}

pub async fn create_registry(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(sid): Path<i64>,
    Json(req): Json<CreateRegistryRequest>,
) -> impl IntoResponse {
    let server = managed_server(&state, &ctx, sid)?;
    validate_pattern(&req.stack_pattern)?;
    let registry_url = registry_host(&req.registry_url)?;
    if req.username.is_empty() {
        return Err(ApiError::bad_request("username is required"));
    }

    let credential = state
        .store
        .create_registry_credential(&NewRegistryCredential {
            server_id: server.id,
            stack_pattern: req.stack_pattern,
            registry_url,
            image_pattern: image_pattern(req.image_pattern),
            username: req.username,
            encrypted_password: state.crypto.encrypt(&req.password)?,
        })
        .api_err("Failed to create registry credential")?;

    tracing::info!(
        server_id = server.id,
        registry = %credential.registry_url,
        user_id = ctx.user.id,
        "Registry credential created"
    );
    Ok::<_, ApiError>((StatusCode::CREATED, Json(ApiResponse::success(credential))))
}

pub async fn get_registry(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path((sid, id)): Path<(i64, i64)>,
) -> impl IntoResponse {
    let server = managed_server(&state, &ctx, sid)?;
    let credential = state
        .store
        .get_registry_credential(server.id, id)
        .api_err("Failed to load registry credential")?
        .or_not_found("Registry credential not found")?;
    Ok::<_, ApiError>(Json(ApiResponse::success(credential)))
}

pub async fn update_registry(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path((sid, id)): Path<(i64, i64)>,
    Json(req): Json<UpdateRegistryRequest>,
) -> impl IntoResponse {
    let server = managed_server(&state, &ctx, sid)?;
    let mut credential = state
        .store
        .get_registry_credential(server.id, id)
        .api_err("Failed to load registry credential")?
        .or_not_found("Registry credential not found")?;

    if let Some(pattern) = req.stack_pattern {
        validate_pattern(&pattern)?;
        credential.stack_pattern = pattern;
    }
    if let Some(url) = req.registry_url {
        credential.registry_url = registry_host(&url)?;
    }
    if req.image_pattern.is_some() {
        credential.image_pattern = image_pattern(req.image_pattern);
    }
    if let Some(username) = req.username {
        if username.is_empty() {
            return Err(ApiError::bad_request("username cannot be empty"));
        }
        credential.username = username;
    }
    // An absent password keeps the stored secret.
    if let Some(password) = req.password {
        credential.encrypted_password = state.crypto.encrypt(&password)?;
    }
    credential.updated_at = Utc::now();

    state
        .store
        .update_registry_credential(&credential)
        .api_err("Failed to update registry credential")?;
    Ok::<_, ApiError>(Json(ApiResponse::success(credential)))
}

pub async fn delete_registry(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path((sid, id)): Path<(i64, i64)>,
) -> impl IntoResponse {
    let server = managed_server(&state, &ctx, sid)?;
    let deleted = state
        .store
        .delete_registry_credential(server.id, id)
        .api_err("Failed to delete registry credential")?;
    if !deleted {
        return Err(ApiError::not_found("Registry credential not found"));
    }
    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}
