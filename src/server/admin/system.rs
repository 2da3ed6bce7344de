use std::sync::Arc;

use axum::{Json, extract::State, response::IntoResponse};
use chrono::Utc;

use super::require_admin;
use super::roles::role_view;
use super::users::user_view;
use crate::auth::RequireInteractive;
use crate::crypto::encrypt_bundle;
use crate::server::AppState;
use crate::server::dto::{ExportRequest, ExportSnapshot};
use crate::server::response::{ApiError, ApiResponse, StoreResultExt};
use crate::types::Permission;

const MIN_PASSPHRASE_LEN: usize = 12;

/// Exports users, roles with their grants, and servers as a passphrase-encrypted bundle.
/// Password hashes and agent tokens are never part of the snapshot.
pub async fn export(
    RequireInteractive(ctx): RequireInteractive,
    State(state): State<Arc<AppState>>,
    Json(req): Json<ExportRequest>,
) -> impl IntoResponse {
    require_admin(&state, &ctx, Permission::AdminSystemExport)?;
    if req.passphrase.chars().count() < MIN_PASSPHRASE_LEN {
        return Err(ApiError::bad_request(format!(
            "Passphrase must be at least {MIN_PASSPHRASE_LEN} characters"
        )));
    }

    let users = state
        .store
        .list_users()
        .api_err("Failed to list users")?
        .into_iter()
        .map(|u| user_view(&state, u))
        .collect::<Result<Vec<_>, _>>()?;
    let roles = state
        .store
        .list_roles()
        .api_err("Failed to list roles")?
        .into_iter()
        .map(|r| role_view(&state, r))
        .collect::<Result<Vec<_>, _>>()?;
    let servers = state.store.list_servers().api_err("Failed to list servers")?;

    let snapshot = ExportSnapshot {
        exported_at: Utc::now(),
        users,
        roles,
        servers,
    };
    let plaintext = serde_json::to_vec(&snapshot).map_err(crate::error::Error::from)?;
    let bundle = encrypt_bundle(&req.passphrase, &plaintext)?;

    tracing::info!(
        user_id = ctx.user.id,
        users = snapshot.users.len(),
        roles = snapshot.roles.len(),
        servers = snapshot.servers.len(),
        "System export created"
    );
    Ok::<_, ApiError>(Json(ApiResponse::success(bundle)))
}
