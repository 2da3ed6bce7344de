mod admin;
mod auth;
pub mod dto;
pub mod rate_limit;
pub mod response;
mod router;
pub mod user;
pub mod validation;
mod ws;

pub use admin::admin_router;
pub use auth::auth_router;
pub use router::{AppState, create_router};
pub use user::user_router;
pub use ws::ws_router;
