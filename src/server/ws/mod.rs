//! Browser-facing WebSocket endpoints. Every socket is authenticated before the upgrade,
//! either by bearer header or by the `token` query parameter.

mod operations;
mod status;
mod terminal;

use std::sync::Arc;

use axum::{Router, extract::ws::Message, routing::get};
use serde::Serialize;
use serde_json::json;

use crate::server::AppState;

pub fn ws_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/stack-status/{server_id}", get(status::stack_status))
        .route("/servers/{sid}/terminal", get(terminal::terminal))
        .route(
            "/servers/{sid}/stacks/{name}/operations",
            get(operations::start_and_stream),
        )
        .route(
            "/servers/{sid}/stacks/{name}/operations/{operation_id}",
            get(operations::stream),
        )
}

fn text<T: Serialize>(value: &T) -> Option<Message> {
    match serde_json::to_string(value) {
        Ok(s) => Some(Message::Text(s.into())),
        Err(e) => {
            tracing::error!("Failed to encode socket frame: {e}");
            None
        }
    }
}

fn error_frame(code: &str, message: impl std::fmt::Display) -> Message {
    Message::Text(
        json!({ "type": "error", "error": code, "message": message.to_string() })
            .to_string()
            .into(),
    )
}
