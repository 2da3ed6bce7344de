use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use serde_json::json;

use super::require_admin;
use crate::audit::AuditEvent;
use crate::auth::{RequireAuth, RequireInteractive, generate_agent_token};
use crate::server::AppState;
use crate::server::dto::{
    ConnectionTest, CreateServerRequest, ServerView, ServerWithToken, UpdateServerRequest,
};
use crate::server::response::{ApiError, ApiResponse, StoreOptionExt, StoreResultExt};
use crate::server::validation::{validate_host, validate_server_name};
use crate::store::NewServer;
use crate::types::{AuditEventType, Permission, Server};

fn load_server(state: &AppState, id: i64) -> Result<Server, ApiError> {
    state
        .store
        .get_server(id)
        .api_err("Failed to load server")?
        .or_not_found("Server not found")
}

fn validate_port(port: u16) -> Result<(), ApiError> {
    if port == 0 {
        return Err(ApiError::bad_request("Port must be between 1 and 65535"));
    }
    Ok(())
}

/// Drops the cached agent client and restarts supervision with the new settings.
fn resync(state: &AppState, server: &Server) {
    state.agents.forget(server.id);
    state.supervisor.sync(server);
}

pub async fn list_servers(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    require_admin(&state, &ctx, Permission::AdminServersRead)?;
    let servers = state.store.list_servers().api_err("Failed to list servers")?;
    let views: Vec<ServerView> = servers
        .into_iter()
        .map(|server| ServerView {
            connected: state.supervisor.is_connected(server.id),
            server,
        })
        .collect();
    Ok::<_, ApiError>(Json(ApiResponse::success(views)))
}

pub async fn get_server(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    require_admin(&state, &ctx, Permission::AdminServersRead)?;
    let server = load_server(&state, id)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(ServerView {
        connected: state.supervisor.is_connected(server.id),
        server,
    })))
}

pub async fn create_server(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateServerRequest>,
) -> impl IntoResponse {
    require_admin(&state, &ctx, Permission::AdminServersWrite)?;
    validate_server_name(&req.name)?;
    validate_host(&req.host)?;
    validate_port(req.port)?;

    let access_token = req
        .access_token
        .filter(|t| !t.is_empty())
        .unwrap_or_else(generate_agent_token);
    let server = state
        .store
        .create_server(&NewServer {
            name: req.name.trim().to_string(),
            description: req.description,
            host: req.host,
            port: req.port,
            skip_ssl_verification: req.skip_ssl_verification,
            access_token,
            is_active: req.is_active,
        })
        .api_err("Failed to create server")?;
    state.supervisor.sync(&server);

    state.audit.record(
        AuditEvent::new(AuditEventType::ServerCreated, &ctx.actor())
            .target("server", Some(server.id), server.name.as_str())
            .server(server.id)
            .metadata(json!({ "host": server.host, "port": server.port })),
    );

    Ok::<_, ApiError>((
        StatusCode::CREATED,
        Json(ApiResponse::success(ServerWithToken {
            access_token: server.access_token.clone(),
            server,
        })),
    ))
}

pub async fn update_server(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateServerRequest>,
) -> impl IntoResponse {
    require_admin(&state, &ctx, Permission::AdminServersWrite)?;
    let mut server = load_server(&state, id)?;

    if let Some(name) = req.name {
        validate_server_name(&name)?;
        server.name = name.trim().to_string();
    }
    if let Some(description) = req.description {
        server.description = description;
    }
    if let Some(host) = req.host {
        validate_host(&host)?;
        server.host = host;
    }
    if let Some(port) = req.port {
        validate_port(port)?;
        server.port = port;
    }
    if let Some(skip) = req.skip_ssl_verification {
        server.skip_ssl_verification = skip;
    }
    if let Some(active) = req.is_active {
        server.is_active = active;
    }
    server.updated_at = Utc::now();

    state
        .store
        .update_server(&server)
        .api_err("Failed to update server")?;
    resync(&state, &server);

    state.audit.record(
        AuditEvent::new(AuditEventType::ServerUpdated, &ctx.actor())
            .target("server", Some(server.id), server.name.as_str())
            .server(server.id),
    );
    Ok::<_, ApiError>(Json(ApiResponse::success(ServerView {
        connected: state.supervisor.is_connected(server.id),
        server,
    })))
}

pub async fn delete_server(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    require_admin(&state, &ctx, Permission::AdminServersWrite)?;
    let server = load_server(&state, id)?;

    state
        .store
        .delete_server(server.id)
        .api_err("Failed to delete server")?;
    state.supervisor.stop(server.id);
    state.agents.forget(server.id);

    state.audit.record(
        AuditEvent::new(AuditEventType::ServerDeleted, &ctx.actor())
            .target("server", Some(server.id), server.name.as_str()),
    );
    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}

/// Calls the agent's health endpoint. Failure is reported in the body, not as an error.
pub async fn test_connection(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    require_admin(&state, &ctx, Permission::AdminServersRead)?;
    let server = load_server(&state, id)?;

    let outcome = match state.agents.client(&server) {
        Ok(client) => client.health().await,
        Err(e) => Err(e),
    };

    let event = AuditEvent::new(
        if outcome.is_ok() {
            AuditEventType::ServerConnectionTestSuccess
        } else {
            AuditEventType::ServerConnectionTestFailure
        },
        &ctx.actor(),
    )
    .target("server", Some(server.id), server.name.as_str())
    .server(server.id);

    let result = match outcome {
        Ok(()) => {
            state.audit.record(event);
            ConnectionTest {
                success: true,
                error: None,
            }
        }
        Err(e) => {
            let message = e.to_string();
            state.audit.record(event.failed(message.as_str()));
            ConnectionTest {
                success: false,
                error: Some(message),
            }
        }
    };
    Ok::<_, ApiError>(Json(ApiResponse::success(result)))
}

/// Issues a new agent token. The old one stops working immediately.
pub async fn regenerate_token(
    RequireInteractive(ctx): RequireInteractive,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    require_admin(&state, &ctx, Permission::AdminServersWrite)?;
    let mut server = load_server(&state, id)?;

    let token = generate_agent_token();
    state
        .store
        .update_server_access_token(server.id, &token)
        .api_err("Failed to update access token")?;
    server.access_token = token.clone();
    resync(&state, &server);

    state.audit.record(
        AuditEvent::new(AuditEventType::ServerAccessTokenRegenerated, &ctx.actor())
            .target("server", Some(server.id), server.name.as_str())
            .server(server.id),
    );
    Ok::<_, ApiError>(Json(ApiResponse::success(ServerWithToken {
        server,
        access_token: token,
    })))
}
