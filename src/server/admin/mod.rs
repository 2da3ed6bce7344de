mod logs;
mod roles;
mod servers;
mod system;
mod users;

use std::sync::Arc;

use axum::{
    Router,
    routing::{delete, get, post},
};

use crate::auth::AuthContext;
use crate::rbac::Target;
use crate::server::AppState;
use crate::server::response::ApiError;
use crate::server::user::access::require;
use crate::types::Permission;

/// Admin-scope permissions are always checked globally.
fn require_admin(
    state: &AppState,
    ctx: &AuthContext,
    permission: Permission,
) -> Result<(), ApiError> {
    require(state, ctx, Target::Global, permission)
}

pub fn admin_router() -> Router<Arc<AppState>> {
    Router::new()
        // User routes
        .route("/users", get(users::list_users).post(users::create_user))
        .route("/users/{id}", get(users::get_user).delete(users::delete_user))
        .route("/users/{id}/roles", post(users::assign_role))
        .route("/users/{id}/roles/{role_id}", delete(users::revoke_role))
        // Role routes
        .route("/roles", get(roles::list_roles).post(roles::create_role))
        .route(
            "/roles/{id}",
            get(roles::get_role)
                .patch(roles::update_role)
                .delete(roles::delete_role),
        )
        .route(
            "/roles/{id}/permissions",
            get(roles::list_role_permissions).post(roles::add_role_permission),
        )
        .route(
            "/roles/{id}/permissions/{permission}",
            delete(roles::remove_role_permission),
        )
        .route(
            "/roles/{id}/stack-permissions",
            get(roles::list_stack_permissions).post(roles::add_stack_permission),
        )
        .route(
            "/roles/{id}/stack-permissions/{grant_id}",
            delete(roles::delete_stack_permission),
        )
        .route("/permissions", get(roles::list_permissions))
        // Server routes
        .route(
            "/servers",
            get(servers::list_servers).post(servers::create_server),
        )
        .route(
            "/servers/{id}",
            get(servers::get_server)
                .patch(servers::update_server)
                .delete(servers::delete_server),
        )
        .route("/servers/{id}/test", post(servers::test_connection))
        .route(
            "/servers/{id}/regenerate-token",
            post(servers::regenerate_token),
        )
        // Log routes
        .route("/operation-logs", get(logs::list_operation_logs))
        .route("/operation-logs/{id}", get(logs::get_operation_log))
        .route("/security-audit-logs", get(logs::list_security_audit_logs))
        // System routes
        .route("/system/export", post(system::export))
}
