mod login;
mod profile;
mod sessions;
mod totp;

use std::sync::Arc;

use axum::{
    Router,
    body::Bytes,
    routing::{get, patch, post},
};
use serde::de::DeserializeOwned;

use crate::server::AppState;
use crate::server::response::ApiError;

pub fn auth_router() -> Router<Arc<AppState>> {
    Router::new()
        // Login flow
        .route("/auth/login", post(login::login))
        .route("/auth/refresh", post(login::refresh))
        .route("/auth/totp/verify", post(login::verify_totp))
        .route("/auth/logout", post(login::logout))
        .route(
            "/auth/session",
            post(login::create_session).delete(login::logout),
        )
        // Profile
        .route("/profile", get(profile::get_profile))
        .route("/profile/password", patch(profile::change_password))
        .route("/profile/email", patch(profile::change_email))
        // Two-factor enrolment
        .route("/totp/setup", get(totp::setup).post(totp::setup))
        .route("/totp/enable", post(totp::enable))
        .route("/totp/disable", post(totp::disable))
        .route("/totp/status", get(totp::status))
        // Sessions
        .route("/sessions", get(sessions::list).post(sessions::list))
        .route("/sessions/revoke", post(sessions::revoke))
        .route("/sessions/revoke-all-others", post(sessions::revoke_others))
}

/// Parses an optional JSON body; an empty body yields the default.
pub(super) fn optional_json<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("Invalid JSON body: {e}")))
}
