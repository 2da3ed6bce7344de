use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};

use super::access::{filter_stacks, server_client, visible_server};
use crate::auth::RequireAuth;
use crate::server::AppState;
use crate::server::dto::{ServerStatistics, ServerView};
use crate::server::response::{ApiError, ApiResponse, StoreResultExt};
use crate::types::Permission;

pub async fn list_servers(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let subject = ctx.subject();
    let servers = state.store.list_servers().api_err("Failed to list servers")?;

    let mut visible = Vec::new();
    for server in servers {
        if state
            .rbac
            .can_access_server(&subject, server.id)
            .api_err("Failed to check server access")?
        {
            let connected = state.supervisor.is_connected(server.id);
            visible.push(ServerView { server, connected });
        }
    }

    Ok::<_, ApiError>(Json(ApiResponse::success(visible)))
}

pub async fn get_server(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(sid): Path<i64>,
) -> impl IntoResponse {
    let server = visible_server(&state, &ctx, sid)?;
    let connected = state.supervisor.is_connected(server.id);
    Ok::<_, ApiError>(Json(ApiResponse::success(ServerView { server, connected })))
}

/// Stack and container counts over the stacks the caller may read.
pub async fn server_statistics(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(sid): Path<i64>,
) -> impl IntoResponse {
    let (server, client) = server_client(&state, &ctx, sid, Permission::StacksRead)?;
    let stacks = client.list_stacks().await?;
    let stacks = filter_stacks(&state, &ctx, server.id, stacks, Permission::StacksRead, |s| {
        s.name.as_str()
    })?;

    let mut stats = ServerStatistics {
        server_id: server.id,
        total_stacks: stacks.len(),
        ..Default::default()
    };

    for stack in &stacks {
        match client.get_stack(&stack.name).await {
            Ok(detail) => {
                stats.total_containers += detail.containers.len();
                let running = detail
                    .containers
                    .iter()
                    .filter(|c| c.state.as_deref() == Some("running"))
                    .count();
                stats.running_containers += running;
                stats.stopped_containers += detail.containers.len() - running;
            }
            Err(e) => {
                tracing::warn!(server_id = server.id, stack = %stack.name, "Failed to load stack: {e}");
            }
        }
    }

    let names: Vec<&str> = stacks.iter().map(|s| s.name.as_str()).collect();
    stats.images_with_updates = state
        .store
        .list_image_updates(server.id)
        .api_err("Failed to load image updates")?
        .iter()
        .filter(|u| u.update_available && names.contains(&u.stack_name.as_str()))
        .count();

    Ok::<_, ApiError>(Json(ApiResponse::success(stats)))
}
