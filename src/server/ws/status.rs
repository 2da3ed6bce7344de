use std::sync::Arc;

use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;

use super::error_frame;
use crate::auth::{AuthContext, RequireAuth};
use crate::hub::{Action, ClientMessage, Connection, Resource, SubscribeError, control_frame};
use crate::server::AppState;
use crate::server::response::ApiError;
use crate::server::user::access::visible_server;

/// Live stack events for one server. The socket starts subscribed to the server's
/// stack status when the caller may read it; further keys are managed by client messages.
pub async fn stack_status(
    ws: WebSocketUpgrade,
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(server_id): Path<i64>,
) -> impl IntoResponse {
    let server = visible_server(&state, &ctx, server_id)?;
    Ok::<_, ApiError>(ws.on_upgrade(move |socket| run(socket, state, ctx, server.id)))
}

fn apply(state: &AppState, conn: &Arc<Connection>, server_id: i64, msg: &ClientMessage) -> String {
    if msg.server_id != server_id {
        return control_frame("error", msg, Some("server_mismatch"));
    }
    let ack = match msg.action {
        Action::Subscribe => "subscribed",
        Action::Unsubscribe => "unsubscribed",
    };
    match state.hub.handle(conn, msg) {
        Ok(()) => control_frame(ack, msg, None),
        Err(SubscribeError::Forbidden) => control_frame("error", msg, Some("forbidden")),
        Err(SubscribeError::Closed) => control_frame("error", msg, Some("closed")),
    }
}

async fn run(socket: WebSocket, state: Arc<AppState>, ctx: AuthContext, server_id: i64) {
    let (conn, mut frames) = state.hub.connect(ctx.subject());
    let closed = conn.closed();
    let (mut sink, mut stream) = socket.split();
    tracing::debug!(conn = conn.id, user_id = ctx.user.id, server_id, "Status socket opened");

    let initial = ClientMessage {
        action: Action::Subscribe,
        resource: Resource::StackStatus,
        server_id,
        stack_name: None,
    };
    let reply = apply(&state, &conn, server_id, &initial);
    if sink.send(Message::Text(reply.into())).await.is_err() {
        state.hub.disconnect(&conn);
        return;
    }

    loop {
        tokio::select! {
            () = closed.cancelled() => break,
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                if sink.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                let reply = match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(text.as_str()) {
                            Ok(msg) => Message::Text(apply(&state, &conn, server_id, &msg).into()),
                            Err(e) => error_frame("invalid_message", e),
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                if sink.send(reply).await.is_err() {
                    break;
                }
            }
        }
    }

    state.hub.disconnect(&conn);
    let _ = sink
        .send(Message::Text(json!({ "type": "closed" }).to_string().into()))
        .await;
    let _ = sink.close().await;
    tracing::debug!(conn = conn.id, "Status socket closed");
}
