use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message as AgentMessage;

use super::error_frame;
use crate::agent::{dial, terminal_url};
use crate::auth::{AuthContext, RequireAuth};
use crate::rbac::Target;
use crate::server::AppState;
use crate::server::response::ApiError;
use crate::server::user::access::{require, visible_server};
use crate::server::validation::validate_stack_name;
use crate::types::{Permission, Server};

/// The first client frame names the stack the session belongs to.
#[derive(Debug, Deserialize)]
struct Opening {
    #[serde(alias = "stack")]
    stack_name: String,
}

pub async fn terminal(
    ws: WebSocketUpgrade,
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(sid): Path<i64>,
) -> impl IntoResponse {
    let server = visible_server(&state, &ctx, sid)?;
    require(&state, &ctx, Target::Server(server.id), Permission::StacksManage)?;
    Ok::<_, ApiError>(ws.on_upgrade(move |socket| relay(socket, state, ctx, server)))
}

/// Stack named by a relayed client frame, if it names one.
fn named_stack(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value
        .get("stack_name")
        .or_else(|| value.get("stack"))?
        .as_str()
        .map(str::to_string)
}

fn may_manage(state: &AppState, ctx: &AuthContext, server_id: i64, stack: &str) -> bool {
    if validate_stack_name(stack).is_err() {
        return false;
    }
    state
        .rbac
        .check(
            &ctx.subject(),
            Target::Stack(server_id, stack),
            Permission::StacksManage,
        )
        .map(|a| a.is_granted())
        .unwrap_or(false)
}

fn to_agent(message: Message) -> Option<AgentMessage> {
    match message {
        Message::Text(t) => Some(AgentMessage::Text(t.as_str().into())),
        Message::Binary(b) => Some(AgentMessage::Binary(b.to_vec().into())),
        _ => None,
    }
}

fn from_agent(message: AgentMessage) -> Option<Message> {
    match message {
        AgentMessage::Text(t) => Some(Message::Text(t.as_str().into())),
        AgentMessage::Binary(b) => Some(Message::Binary(b.to_vec().into())),
        _ => None,
    }
}

async fn relay(socket: WebSocket, state: Arc<AppState>, ctx: AuthContext, server: Server) {
    let (mut client_tx, mut client_rx) = socket.split();

    let opening = loop {
        match client_rx.next().await {
            Some(Ok(Message::Text(body))) => break body,
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
            Some(Ok(_)) => {}
        }
    };
    let stack = match serde_json::from_str::<Opening>(opening.as_str()) {
        Ok(o) => o.stack_name,
        Err(e) => {
            let _ = client_tx.send(error_frame("invalid_message", e)).await;
            let _ = client_tx.close().await;
            return;
        }
    };

    if !may_manage(&state, &ctx, server.id, &stack) {
        let _ = client_tx
            .send(error_frame("forbidden", "Insufficient permissions for this stack"))
            .await;
        let _ = client_tx.close().await;
        return;
    }

    let agent = match dial(&terminal_url(&server), &server.access_token).await {
        Ok(agent) => agent,
        Err(e) => {
            tracing::warn!(server_id = server.id, "Terminal dial failed: {e}");
            let _ = client_tx.send(error_frame("agent_error", e)).await;
            let _ = client_tx.close().await;
            return;
        }
    };
    let (mut agent_tx, mut agent_rx) = agent.split();

    // The agent needs the opening frame too.
    if agent_tx
        .send(AgentMessage::Text(opening.as_str().into()))
        .await
        .is_err()
    {
        let _ = client_tx.close().await;
        return;
    }
    tracing::info!(server_id = server.id, stack = %stack, user_id = ctx.user.id, "Terminal session opened");

    // Frames may address other stacks of the same server; each one is checked once.
    let mut granted = HashSet::from([stack.clone()]);

    loop {
        tokio::select! {
            incoming = client_rx.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(message)) => {
                    if let Message::Text(text) = &message {
                        if let Some(named) = named_stack(text.as_str()) {
                            if !granted.contains(&named) {
                                if !may_manage(&state, &ctx, server.id, &named) {
                                    let denied = error_frame(
                                        "forbidden",
                                        format!("Insufficient permissions for stack '{named}'"),
                                    );
                                    if client_tx.send(denied).await.is_err() {
                                        break;
                                    }
                                    continue;
                                }
                                granted.insert(named);
                            }
                        }
                    }
                    if let Some(frame) = to_agent(message) {
                        if agent_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                }
            },
            outgoing = agent_rx.next() => match outgoing {
                Some(Ok(AgentMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(message)) => {
                    if let Some(frame) = from_agent(message) {
                        if client_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                }
            },
        }
    }

    let _ = agent_tx.close().await;
    let _ = client_tx.close().await;
    tracing::info!(server_id = server.id, stack = %stack, "Terminal session closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_stack() {
        assert_eq!(
            named_stack(r#"{"stack_name":"web-api","data":"ls\n"}"#).as_deref(),
            Some("web-api")
        );
        assert_eq!(named_stack(r#"{"stack":"db"}"#).as_deref(), Some("db"));
        assert_eq!(named_stack(r#"{"data":"ls\n"}"#), None);
        assert_eq!(named_stack("raw keystrokes"), None);
        assert_eq!(named_stack(r#"{"stack_name":7}"#), None);
    }
}
