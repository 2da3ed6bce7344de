use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};

use super::access::{filter_stacks, require, visible_server};
use crate::auth::RequireAuth;
use crate::rbac::Target;
use crate::server::AppState;
use crate::server::response::{ApiError, ApiResponse, StoreResultExt};
use crate::types::{ContainerImageUpdate, Permission};

/// Stored rows across every server, limited to stacks the caller may read.
pub async fn list_all(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let subject = ctx.subject();
    let rows = state
        .store
        .list_all_image_updates()
        .api_err("Failed to list image updates")?;

    let mut visible: Vec<ContainerImageUpdate> = Vec::with_capacity(rows.len());
    for row in rows {
        let access = state
            .rbac
            .check(
                &subject,
                Target::Stack(row.server_id, &row.stack_name),
                Permission::StacksRead,
            )
            .api_err("Failed to check permissions")?;
        if access.is_granted() {
            visible.push(row);
        }
    }
    Ok::<_, ApiError>(Json(ApiResponse::success(visible)))
}

/// Stored rows for one server, reconciled with the digests its containers run now.
pub async fn list_for_server(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(sid): Path<i64>,
) -> impl IntoResponse {
    let server = visible_server(&state, &ctx, sid)?;
    require(&state, &ctx, Target::Server(server.id), Permission::StacksRead)?;

    let rows = state.images.live_view(&server).await?;
    let rows = filter_stacks(&state, &ctx, server.id, rows, Permission::StacksRead, |r| {
        r.stack_name.as_str()
    })?;
    Ok::<_, ApiError>(Json(ApiResponse::success(rows)))
}

/// Runs a digest check for one server now instead of waiting for the poller.
pub async fn check_server(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(sid): Path<i64>,
) -> impl IntoResponse {
    let server = visible_server(&state, &ctx, sid)?;
    require(&state, &ctx, Target::Server(server.id), Permission::StacksManage)?;

    let summary = state.images.check_server(&server).await?;
    Ok::<_, ApiError>(Json(ApiResponse::success(serde_json::json!({
        "stored": summary.stored,
        "available": summary.available,
        "removed": summary.removed,
    }))))
}
