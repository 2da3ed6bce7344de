use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};

use super::access::stack_client;
use crate::auth::RequireAuth;
use crate::operations::StartRequest;
use crate::server::AppState;
use crate::server::dto::{OperationDetail, StartedOperation};
use crate::server::response::{ApiError, ApiResponse, PageParams, StoreOptionExt, StoreResultExt};
use crate::server::validation::validate_stack_name;
use crate::store::OperationLogFilter;
use crate::types::Permission;

/// Starts a compose command. The stream runs detached; follow it over the WebSocket.
pub async fn start_operation(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path((sid, name)): Path<(i64, String)>,
    Json(req): Json<StartRequest>,
) -> impl IntoResponse {
    validate_stack_name(&name)?;
    let (server, _) = stack_client(&state, &ctx, sid, &name, Permission::StacksManage)?;

    let started = state
        .operations
        .start(&server, &name, &req, ctx.user.id, &ctx.actor())?;

    Ok::<_, ApiError>(Json(ApiResponse::success(StartedOperation {
        operation_id: started.log.operation_id.clone(),
        log: started.log,
    })))
}

pub async fn list_operations(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path((sid, name)): Path<(i64, String)>,
    Query(page): Query<PageParams>,
) -> impl IntoResponse {
    let (server, _) = stack_client(&state, &ctx, sid, &name, Permission::StacksRead)?;
    let (limit, offset) = page.window();
    let logs = state
        .store
        .list_operation_logs(&OperationLogFilter {
            server_id: Some(server.id),
            stack_name: Some(name),
            limit,
            offset,
            ..Default::default()
        })
        .api_err("Failed to list operations")?;
    Ok::<_, ApiError>(Json(ApiResponse::success(logs)))
}

pub async fn get_operation(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path((sid, name, operation_id)): Path<(i64, String, String)>,
) -> impl IntoResponse {
    let (server, _) = stack_client(&state, &ctx, sid, &name, Permission::StacksRead)?;
    let log = state
        .store
        .get_operation_log_by_operation_id(&operation_id)
        .api_err("Failed to load operation")?
        .filter(|l| l.server_id == server.id && l.stack_name == name)
        .or_not_found("Operation not found")?;
    let messages = state
        .store
        .list_operation_messages(log.id)
        .api_err("Failed to load operation messages")?;

    Ok::<_, ApiError>(Json(ApiResponse::success(OperationDetail {
        running: state.operations.is_running(&log.operation_id),
        log,
        messages,
    })))
}

/// The caller's own operations across every server.
pub async fn list_my_operations(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Query(page): Query<PageParams>,
) -> impl IntoResponse {
    let (limit, offset) = page.window();
    let logs = state
        .store
        .list_operation_logs(&OperationLogFilter {
            user_id: Some(ctx.user.id),
            limit,
            offset,
            ..Default::default()
        })
        .api_err("Failed to list operations")?;
    Ok::<_, ApiError>(Json(ApiResponse::success(logs)))
}
