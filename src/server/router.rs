use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::{Router, routing::get};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::admin::admin_router;
use super::auth::auth_router;
use super::rate_limit::RateLimits;
use super::user::user_router;
use super::ws::ws_router;
use crate::agent::{AgentRegistry, AgentSupervisor};
use crate::audit::{AuditLogger, FileLogger};
use crate::auth::{AuthService, RevocationStore};
use crate::config::Config;
use crate::crypto::Crypto;
use crate::error::Result;
use crate::housekeeping::Housekeeper;
use crate::hub::Hub;
use crate::images::ImageUpdateService;
use crate::operations::Operations;
use crate::rbac::Rbac;
use crate::store::Store;

/// The composition root: every service, built once and shared by all handlers.
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub crypto: Crypto,
    pub auth: AuthService,
    pub rbac: Arc<Rbac>,
    pub audit: Arc<AuditLogger>,
    /// Present when any stream is mirrored to JSONL files.
    pub files: Option<Arc<FileLogger>>,
    pub revocations: Arc<RevocationStore>,
    pub agents: Arc<AgentRegistry>,
    pub supervisor: Arc<AgentSupervisor>,
    pub hub: Arc<Hub>,
    pub operations: Arc<Operations>,
    pub images: Arc<ImageUpdateService>,
    pub limits: RateLimits,
}

impl AppState {
    /// Wires the service graph over an initialized store. Must run inside a runtime.
    pub fn new(config: Config, store: Arc<dyn Store>) -> Result<Self> {
        let crypto = Crypto::new(&config.encryption_secret);

        let files = (config.logging.operation_log_to_file
            || config.logging.security_audit_log_to_file)
            .then(|| Arc::new(FileLogger::start(PathBuf::from(&config.logging.log_dir))));
        let audit = Arc::new(AuditLogger::new(
            store.clone(),
            files.clone(),
            config.logging.security_audit_log_to_file,
            config.logging.operation_log_to_file,
        ));

        let revocations = Arc::new(RevocationStore::new(store.clone()));
        let loaded = revocations.load()?;
        tracing::debug!(loaded, "Loaded revoked token ids");

        let auth = AuthService::new(
            store.clone(),
            &config.jwt,
            revocations.clone(),
            crypto.clone(),
            audit.clone(),
            config.email_verification_required,
        );

        let rbac = Arc::new(Rbac::new(store.clone()));
        let hub = Arc::new(Hub::new(rbac.clone()));
        let agents = Arc::new(AgentRegistry::new(config.agent.clone()));
        let supervisor = Arc::new(AgentSupervisor::new(hub.clone()));

        let operations = Arc::new(Operations::new(
            store.clone(),
            agents.clone(),
            hub.clone(),
            audit.clone(),
            crypto.clone(),
            config.operations.timeout,
        ));
        let images = Arc::new(ImageUpdateService::new(
            store.clone(),
            crypto.clone(),
            agents.clone(),
            config.image_updates.clone(),
        ));
        let limits = RateLimits::new(config.rate_limit_enabled);

        Ok(Self {
            config,
            store,
            crypto,
            auth,
            rbac,
            audit,
            files,
            revocations,
            agents,
            supervisor,
            hub,
            operations,
            images,
            limits,
        })
    }

    /// Starts agent supervision, the image poller and housekeeping.
    pub fn spawn_background(self: &Arc<Self>, cancel: &CancellationToken) -> Result<Vec<JoinHandle<()>>> {
        self.supervisor
            .start_all(&self.store.list_active_servers()?);

        let housekeeper = Arc::new(Housekeeper::new(
            self.store.clone(),
            self.revocations.clone(),
            self.config.operations.retention_days,
            self.config.housekeeping_interval,
        ));

        let state = self.clone();
        let limits_cancel = cancel.clone();
        let interval = self.config.housekeeping_interval;
        Ok(vec![
            tokio::spawn(self.images.clone().run(cancel.clone())),
            tokio::spawn(housekeeper.run(cancel.clone())),
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        () = limits_cancel.cancelled() => break,
                        _ = ticker.tick() => state.limits.shrink(),
                    }
                }
            }),
        ])
    }

    /// Closes client sockets, stops agent supervision and flushes file logs.
    pub async fn shutdown(&self) {
        self.hub.close();
        self.supervisor.shutdown();
        if let Some(files) = &self.files {
            files.close().await;
        }
        if let Err(e) = self.store.close() {
            tracing::warn!("Failed to close store: {e}");
        }
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let response = next.run(request).await;

    let latency = start.elapsed();
    let status = response.status();

    tracing::info!(
        "{} {} {} {}ms",
        method,
        uri.path(),
        status.as_u16(),
        latency.as_millis()
    );

    response
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1/admin", admin_router())
        .nest("/api/v1", auth_router())
        .nest("/api/v1", user_router())
        .nest("/ws/api", ws_router())
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::store::SqliteStore;

    fn app() -> Router {
        let config = Config::from_lookup(|key| match key {
            "ENCRYPTION_SECRET" => Some("router-test-secret-0123456789".into()),
            "JWT_SECRET_KEY" => Some("router-test-jwt".into()),
            "RATE_LIMIT_ENABLED" => Some("false".into()),
            _ => None,
        })
        .unwrap();
        let store = SqliteStore::in_memory().unwrap();
        store.initialize().unwrap();
        create_router(Arc::new(AppState::new(config, Arc::new(store)).unwrap()))
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let response = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_requires_credentials() {
        let response = app()
            .oneshot(Request::get("/api/v1/servers").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key("www-authenticate"));
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let response = app()
            .oneshot(Request::get("/api/v1/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
