use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::access::stack_client;
use crate::auth::RequireAuth;
use crate::server::AppState;
use crate::server::response::{ApiError, ApiResponse};
use crate::server::validation::validate_container_name;
use crate::types::Permission;

/// Options forwarded verbatim to the agent's log endpoints.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LogQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tail: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamps: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}

pub async fn stack_logs(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path((sid, name)): Path<(i64, String)>,
    Query(query): Query<LogQuery>,
) -> impl IntoResponse {
    let (_, client) = stack_client(&state, &ctx, sid, &name, Permission::LogsRead)?;
    let logs: Value = client
        .json_with_query(Method::GET, &format!("/stacks/{name}/logs"), &query, None)
        .await?;
    Ok::<_, ApiError>(Json(ApiResponse::success(logs)))
}

pub async fn container_logs(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path((sid, name, container)): Path<(i64, String, String)>,
    Query(query): Query<LogQuery>,
) -> impl IntoResponse {
    validate_container_name(&container)?;
    let (_, client) = stack_client(&state, &ctx, sid, &name, Permission::LogsRead)?;
    let logs: Value = client
        .json_with_query(
            Method::GET,
            &format!("/stacks/{name}/containers/{container}/logs"),
            &query,
            None,
        )
        .await?;
    Ok::<_, ApiError>(Json(ApiResponse::success(logs)))
}
