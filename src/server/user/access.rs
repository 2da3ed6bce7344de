use std::sync::Arc;

use crate::agent::AgentClient;
use crate::auth::AuthContext;
use crate::rbac::Target;
use crate::server::AppState;
use crate::server::response::{ApiError, StoreOptionExt, StoreResultExt};
use crate::server::validation::validate_stack_name;
use crate::types::{Permission, Server};

/// Fails with the matching 403 unless the caller holds `permission` on `target`.
pub fn require(
    state: &AppState,
    ctx: &AuthContext,
    target: Target<'_>,
    permission: Permission,
) -> Result<(), ApiError> {
    let access = state
        .rbac
        .check(&ctx.subject(), target, permission)
        .api_err("Failed to check permissions")?;
    if access.is_granted() {
        Ok(())
    } else {
        Err(ApiError::denied(access))
    }
}

/// Loads a server the caller can see. Servers without any grant are reported missing.
pub fn visible_server(
    state: &AppState,
    ctx: &AuthContext,
    server_id: i64,
) -> Result<Server, ApiError> {
    let server = state
        .store
        .get_server(server_id)
        .api_err("Failed to load server")?
        .or_not_found("Server not found")?;

    let visible = state
        .rbac
        .can_access_server(&ctx.subject(), server.id)
        .api_err("Failed to check server access")?;
    if !visible {
        return Err(ApiError::not_found("Server not found"));
    }
    Ok(server)
}

/// Checks `permission` on one stack and returns the agent client for its server.
///
/// The name is validated first: it is matched against glob patterns and then
/// interpolated into agent URLs, so separators or dot segments must never reach either.
pub fn stack_client(
    state: &AppState,
    ctx: &AuthContext,
    server_id: i64,
    stack: &str,
    permission: Permission,
) -> Result<(Server, Arc<AgentClient>), ApiError> {
    validate_stack_name(stack)?;
    let server = visible_server(state, ctx, server_id)?;
    require(state, ctx, Target::Stack(server.id, stack), permission)?;
    let client = state.agents.client(&server)?;
    Ok((server, client))
}

/// Checks `permission` on any stack of the server and returns its agent client.
pub fn server_client(
    state: &AppState,
    ctx: &AuthContext,
    server_id: i64,
    permission: Permission,
) -> Result<(Server, Arc<AgentClient>), ApiError> {
    let server = visible_server(state, ctx, server_id)?;
    require(state, ctx, Target::Server(server.id), permission)?;
    let client = state.agents.client(&server)?;
    Ok((server, client))
}

/// Keeps only the names the caller may exercise `permission` on.
pub fn filter_stacks<T>(
    state: &AppState,
    ctx: &AuthContext,
    server_id: i64,
    items: Vec<T>,
    permission: Permission,
    name: impl Fn(&T) -> &str,
) -> Result<Vec<T>, ApiError> {
    let subject = ctx.subject();
    let mut visible = Vec::with_capacity(items.len());
    for item in items {
        let access = state
            .rbac
            .check(&subject, Target::Stack(server_id, name(&item)), permission)
            .api_err("Failed to check permissions")?;
        if access.is_granted() {
            visible.push(item);
        }
    }
    Ok(visible)
}
