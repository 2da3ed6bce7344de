//! # Berth
//!
//! A control plane for Docker Compose stacks running on a fleet of agents, usable both
//! as a standalone binary and as a library.
//!
//! ## Library Usage
//!
//! ```toml
//! [dependencies]
//! berth = { version = "0.0.1", default-features = false }
//! ```
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use berth::config::Config;
//! use berth::server::{AppState, create_router};
//! use berth::store::{SqliteStore, Store};
//!
//! let config = Config::from_env()?;
//! let store = SqliteStore::new(config.database_path())?;
//! store.initialize()?;
//!
//! let state = Arc::new(AppState::new(config, Arc::new(store))?);
//! let router = create_router(state);
//! // Serve with axum, using `into_make_service_with_connect_info::<SocketAddr>()`.
//! ```
//!
//! ## Feature Flags
//!
//! - `cli` (default): Builds the `berth` binary. Disable with `default-features = false`.

pub mod agent;
pub mod audit;
pub mod auth;
pub mod compose;
pub mod config;
pub mod crypto;
pub mod error;
pub mod housekeeping;
pub mod hub;
pub mod images;
pub mod operations;
pub mod rbac;
pub mod server;
pub mod store;
pub mod types;
