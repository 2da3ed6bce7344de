use std::sync::Arc;

use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt, stream::SplitSink};
use serde_json::json;

use super::{error_frame, text};
use crate::auth::{AuthContext, RequireAuth};
use crate::operations::{Follow, StartRequest};
use crate::server::AppState;
use crate::server::response::{ApiError, StoreOptionExt, StoreResultExt};
use crate::server::user::access::stack_client;
use crate::server::validation::validate_stack_name;
use crate::types::{OperationLog, Permission, Server};

type Sink = SplitSink<WebSocket, Message>;

/// Waits for a `{command, options, services}` frame, starts it, then streams its output.
pub async fn start_and_stream(
    ws: WebSocketUpgrade,
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path((sid, name)): Path<(i64, String)>,
) -> impl IntoResponse {
    validate_stack_name(&name)?;
    let (server, _) = stack_client(&state, &ctx, sid, &name, Permission::StacksManage)?;
    Ok::<_, ApiError>(ws.on_upgrade(move |socket| start_session(socket, state, ctx, server, name)))
}

/// Replays and tails an existing operation.
pub async fn stream(
    ws: WebSocketUpgrade,
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
    let follow = state.operations.follow(&log)?;

    Ok::<_, ApiError>(ws.on_upgrade(move |socket| async move {
        let (mut sink, _) = socket.split();
        forward(&mut sink, &log, follow).await;
        let _ = sink.close().await;
    }))
}

async fn start_session(
    socket: WebSocket,
    state: Arc<AppState>,
    ctx: AuthContext,
    server: Server,
    stack: String,
) {
    let (mut sink, mut stream) = socket.split();

    let request = loop {
        match stream.next().await {
            Some(Ok(Message::Text(body))) => {
                match serde_json::from_str::<StartRequest>(body.as_str()) {
                    Ok(request) => break request,
                    Err(e) => {
                        let _ = sink.send(error_frame("invalid_message", e)).await;
                        let _ = sink.close().await;
                        return;
                    }
                }
            }
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
            Some(Ok(_)) => {}
        }
    };

    let started = match state
        .operations
        .start(&server, &stack, &request, ctx.user.id, &ctx.actor())
    {
        Ok(started) => started,
        Err(e) => {
            let error = ApiError::from(e);
            let _ = sink.send(error_frame(error.code, &error.message)).await;
            let _ = sink.close().await;
            return;
        }
    };

    let follow = match state.operations.follow(&started.log) {
        Ok(follow) => follow,
        Err(e) => {
            tracing::error!(operation_id = %started.log.operation_id, "Failed to follow operation: {e}");
            let _ = sink.send(error_frame("internal_error", "Failed to follow operation")).await;
            let _ = sink.close().await;
            return;
        }
    };

    forward(&mut sink, &started.log, follow).await;
    let _ = sink.close().await;
}

/// Sends a `started` header and then every message until the terminal one.
async fn forward(sink: &mut Sink, log: &OperationLog, mut follow: Follow) {
    let header = json!({
        "type": "started",
        "operationId": log.operation_id,
        "log": log,
    });
    if sink.send(Message::Text(header.to_string().into())).await.is_err() {
        return;
    }

    loop {
        match follow.next().await {
            Ok(Some(message)) => {
                let Some(frame) = text(&message) else { continue };
                if sink.send(frame).await.is_err() {
                    // The operation keeps running without a viewer.
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(operation_id = %log.operation_id, "Operation stream failed: {e}");
                let _ = sink.send(error_frame("internal_error", "Operation stream failed")).await;
                return;
            }
        }
    }
}
