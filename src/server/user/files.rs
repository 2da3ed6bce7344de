//! Pass-through to the agent's file API for a stack directory.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use reqwest::Method;
use serde_json::{Value, json};

use super::access::stack_client;
use crate::audit::AuditEvent;
use crate::auth::{AuthContext, RequireAuth};
use crate::server::AppState;
use crate::server::dto::{FileQuery, FileRenameRequest};
use crate::server::response::{ApiError, ApiResponse};
use crate::server::validation::validate_relative_path;
use crate::types::{AuditEventType, Permission};

fn audit_file(
    state: &AppState,
    ctx: &AuthContext,
    event_type: AuditEventType,
    server_id: i64,
    stack: &str,
    metadata: Value,
) {
    state.audit.record(
        AuditEvent::new(event_type, &ctx.actor())
            .target("file", None, metadata["path"].as_str().unwrap_or_default())
            .server(server_id)
            .stack(stack)
            .metadata(metadata),
    );
}

pub async fn list_files(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path((sid, name)): Path<(i64, String)>,
    Query(query): Query<FileQuery>,
) -> impl IntoResponse {
    validate_relative_path(&query.path)?;
    let (_, client) = stack_client(&state, &ctx, sid, &name, Permission::FilesRead)?;
    let listing: Value = client
        .json_with_query(
            Method::GET,
            &format!("/stacks/{name}/files"),
            &[("path", query.path.as_str())],
            None,
        )
        .await?;
    Ok::<_, ApiError>(Json(ApiResponse::success(listing)))
}

pub async fn read_file(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path((sid, name)): Path<(i64, String)>,
    Query(query): Query<FileQuery>,
) -> impl IntoResponse {
    validate_relative_path(&query.path)?;
    let (server, client) = stack_client(&state, &ctx, sid, &name, Permission::FilesRead)?;
    let content: Value = client
        .json_with_query(
            Method::GET,
            &format!("/stacks/{name}/files/content"),
            &[("path", query.path.as_str())],
            None,
        )
        .await?;

    audit_file(
        &state,
        &ctx,
        AuditEventType::FileDownloaded,
        server.id,
        &name,
        json!({ "path": query.path }),
    );
    Ok::<_, ApiError>(Json(ApiResponse::success(content)))
}

/// Writes a file. The body is forwarded as-is and must name a relative `path`.
pub async fn write_file(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path((sid, name)): Path<(i64, String)>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let path = body
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::bad_request("path is required"))?
        .to_string();
    validate_relative_path(&path)?;

    let (server, client) = stack_client(&state, &ctx, sid, &name, Permission::FilesWrite)?;
    client
        .request(
            Method::POST,
            &format!("/stacks/{name}/files/content"),
            Some(&body),
        )
        .await?;

    audit_file(
        &state,
        &ctx,
        AuditEventType::FileUploaded,
        server.id,
        &name,
        json!({ "path": path }),
    );
    Ok::<_, ApiError>(Json(ApiResponse::success(json!({ "path": path }))))
}

pub async fn delete_file(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path((sid, name)): Path<(i64, String)>,
    Query(query): Query<FileQuery>,
) -> impl IntoResponse {
    if query.path.is_empty() {
        return Err(ApiError::bad_request("path is required"));
    }
    validate_relative_path(&query.path)?;

    let (server, client) = stack_client(&state, &ctx, sid, &name, Permission::FilesWrite)?;
    client
        .request_with_query(
            Method::DELETE,
            &format!("/stacks/{name}/files"),
            &[("path", query.path.as_str())],
            None,
        )
        .await?;

    audit_file(
        &state,
        &ctx,
        AuditEventType::FileDeleted,
        server.id,
        &name,
        json!({ "path": query.path }),
    );
    Ok::<_, ApiError>(Json(ApiResponse::success(json!({ "deleted": query.path }))))
}

pub async fn rename_file(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path((sid, name)): Path<(i64, String)>,
    Json(req): Json<FileRenameRequest>,
) -> impl IntoResponse {
    validate_relative_path(&req.from)?;
    validate_relative_path(&req.to)?;

    let (server, client) = stack_client(&state, &ctx, sid, &name, Permission::FilesWrite)?;
    let body = json!({ "from": req.from, "to": req.to });
    client
        .request(
            Method::POST,
            &format!("/stacks/{name}/files/rename"),
            Some(&body),
        )
        .await?;

    audit_file(
        &state,
        &ctx,
        AuditEventType::FileRenamed,
        server.id,
        &name,
        json!({ "path": req.to, "from": req.from }),
    );
    Ok::<_, ApiError>(Json(ApiResponse::success(body)))
}
