pub mod access;
mod api_keys;
mod files;
mod images;
mod logs;
mod operations;
mod registries;
mod servers;
mod stacks;

use std::sync::Arc;

use axum::{
    Router,
    routing::{delete, get, post},
};

use crate::server::AppState;

pub fn user_router() -> Router<Arc<AppState>> {
    Router::new()
        // Servers
        .route("/servers", get(servers::list_servers))
        .route("/servers/{sid}", get(servers::get_server))
        .route("/servers/{sid}/statistics", get(servers::server_statistics))
        // Stacks
        .route(
            "/servers/{sid}/stacks",
            get(stacks::list_stacks).post(stacks::create_stack),
        )
        .route(
            "/servers/{sid}/stacks/{name}",
            get(stacks::get_stack).delete(stacks::delete_stack),
        )
        .route(
            "/servers/{sid}/stacks/{name}/compose",
            get(stacks::get_compose).patch(stacks::patch_compose),
        )
        .route(
            "/servers/{sid}/stacks/{name}/compose/images",
            post(stacks::update_images),
        )
        .route("/servers/{sid}/stacks/{name}/stats", get(stacks::stack_stats))
        .route(
            "/servers/{sid}/stacks/{name}/permissions",
            get(stacks::stack_permissions),
        )
        // Files
        .route(
            "/servers/{sid}/stacks/{name}/files",
            get(files::list_files).delete(files::delete_file),
        )
        .route(
            "/servers/{sid}/stacks/{name}/files/content",
            get(files::read_file).post(files::write_file),
        )
        .route(
            "/servers/{sid}/stacks/{name}/files/rename",
            post(files::rename_file),
        )
        // Logs
        .route("/servers/{sid}/stacks/{name}/logs", get(logs::stack_logs))
        .route(
            "/servers/{sid}/stacks/{name}/containers/{container}/logs",
            get(logs::container_logs),
        )
        // Operations
        .route("/operations", get(operations::list_my_operations))
        .route(
            "/servers/{sid}/stacks/{name}/operations",
            get(operations::list_operations).post(operations::start_operation),
        )
        .route(
            "/servers/{sid}/stacks/{name}/operations/{operation_id}",
            get(operations::get_operation),
        )
        // Image updates
        .route("/image-updates", get(images::list_all))
        .route("/servers/{sid}/image-updates", get(images::list_for_server))
        .route(
            "/servers/{sid}/image-updates/check",
            post(images::check_server),
        )
        // API keys
        .route(
            "/api-keys",
            get(api_keys::list_keys).post(api_keys::create_key),
        )
        .route(
            "/api-keys/{id}",
            get(api_keys::get_key).delete(api_keys::delete_key),
        )
        .route(
            "/api-keys/{id}/scopes",
            get(api_keys::list_scopes).post(api_keys::add_scope),
        )
        .route(
            "/api-keys/{id}/scopes/{scope_id}",
            delete(api_keys::remove_scope),
        )
        // Registry credentials
        .route(
            "/servers/{sid}/registries",
            get(registries::list_registries).post(registries::create_registry),
        )
        .route(
            "/servers/{sid}/registries/{id}",
            get(registries::get_registry)
                .patch(registries::update_registry)
                .delete(registries::delete_registry),
        )
}
