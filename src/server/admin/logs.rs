use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};

use super::require_admin;
use crate::auth::RequireAuth;
use crate::server::AppState;
use crate::server::dto::{AuditLogQuery, OperationDetail, OperationLogQuery};
use crate::server::response::{ApiError, ApiResponse, PageParams, StoreOptionExt, StoreResultExt};
use crate::store::{AuditLogFilter, OperationLogFilter};
use crate::types::Permission;

pub async fn list_operation_logs(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Query(query): Query<OperationLogQuery>,
) -> impl IntoResponse {
    require_admin(&state, &ctx, Permission::AdminLogsRead)?;
    let (limit, offset) = PageParams {
        limit: query.limit,
        offset: query.offset,
    }
    .window();

    let logs = state
        .store
        .list_operation_logs(&OperationLogFilter {
            user_id: query.user_id,
            server_id: query.server_id,
            stack_name: query.stack_name,
            limit,
            offset,
        })
        .api_err("Failed to list operation logs")?;
    Ok::<_, ApiError>(Json(ApiResponse::success(logs)))
}

pub async fn get_operation_log(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    require_admin(&state, &ctx, Permission::AdminLogsRead)?;
    let log = state
        .store
        .get_operation_log(id)
        .api_err("Failed to load operation log")?
        .or_not_found("Operation log not found")?;
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

pub async fn list_security_audit_logs(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuditLogQuery>,
) -> impl IntoResponse {
    require_admin(&state, &ctx, Permission::AdminLogsRead)?;
    let (limit, offset) = PageParams {
        limit: query.limit,
        offset: query.offset,
    }
    .window();

    let logs = state
        .store
        .list_security_audit_logs(&AuditLogFilter {
            event_type: query.event_type,
            event_category: query.event_category,
            severity: query.severity,
            actor_user_id: query.actor_user_id,
            limit,
            offset,
        })
        .api_err("Failed to list security audit logs")?;
    Ok::<_, ApiError>(Json(ApiResponse::success(logs)))
}
