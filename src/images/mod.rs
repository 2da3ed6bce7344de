//! Periodic image digest checks and their reconciliation with live containers.

mod registry;

pub use registry::{
    credentials_for_stack, normalize_registry_url, select_credential, to_registry_auth,
};

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::AgentRegistry;
use crate::agent::types::{CheckUpdatesRequest, ImageCheckResult, StackDetail};
use crate::config::ImageUpdateConfig;
use crate::crypto::Crypto;
use crate::error::Result;
use crate::store::{NewImageUpdate, Store};
use crate::types::{ContainerImageUpdate, Server};

/// Strips the repository part of a `repo@sha256:...` digest.
#[must_use]
pub fn bare_digest(digest: &str) -> &str {
    digest.rsplit_once('@').map_or(digest, |(_, d)| d).trim()
}

fn update_available(current: &str, latest: &str, error: Option<&str>) -> bool {
    let current = bare_digest(current);
    let latest = bare_digest(latest);
    error.is_none_or(str::is_empty) && !latest.is_empty() && current != latest
}

/// Rows to persist for one agent response. Results the agent could not resolve at all
/// are skipped.
#[must_use]
pub fn records_from(results: Vec<ImageCheckResult>) -> Vec<NewImageUpdate> {
    results
        .into_iter()
        .filter_map(|r| {
            let error = r.error.filter(|e| !e.is_empty());
            if r.current_repo_digest.is_empty() && r.latest_repo_digest.is_empty() && error.is_none()
            {
                return None;
            }
            Some(NewImageUpdate {
                update_available: update_available(
                    &r.current_repo_digest,
                    &r.latest_repo_digest,
                    error.as_deref(),
                ),
                stack_name: r.stack_name,
                container_name: r.container_name,
                current_image_name: r.image,
                current_repo_digest: r.current_repo_digest,
                latest_repo_digest: r.latest_repo_digest,
                check_error: error,
            })
        })
        .collect()
}

/// Live digests keyed by `(stack, container)`.
pub type LiveDigests = HashMap<(String, String), String>;

#[must_use]
pub fn live_digests(stacks: &[StackDetail]) -> LiveDigests {
    let mut digests = LiveDigests::new();
    for stack in stacks {
        for container in &stack.containers {
            if let Some(digest) = container.repo_digest.as_deref().filter(|d| !d.is_empty()) {
                digests.insert(
                    (stack.name.clone(), container.name.clone()),
                    bare_digest(digest).to_string(),
                );
            }
        }
    }
    digests
}

/// Overwrites stored current digests with live ones and recomputes availability.
/// Only the returned rows change; nothing is written back.
#[must_use]
pub fn reconcile(rows: Vec<ContainerImageUpdate>, live: &LiveDigests) -> Vec<ContainerImageUpdate> {
    rows.into_iter()
        .map(|mut row| {
            let key = (row.stack_name.clone(), row.container_name.clone());
            if let Some(digest) = live.get(&key) {
                if bare_digest(&row.current_repo_digest) != digest.as_str() {
                    row.current_repo_digest = digest.clone();
                    row.update_available = update_available(
                        &row.current_repo_digest,
                        &row.latest_repo_digest,
                        row.check_error.as_deref(),
                    );
                }
            }
            row
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckSummary {
    pub stored: usize,
    pub available: usize,
    pub removed: usize,
}

pub struct ImageUpdateService {
    store: Arc<dyn Store>,
    crypto: Crypto,
    agents: Arc<AgentRegistry>,
    config: ImageUpdateConfig,
}

impl ImageUpdateService {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        crypto: Crypto,
        agents: Arc<AgentRegistry>,
        config: ImageUpdateConfig,
    ) -> Self {
        Self {
            store,
            crypto,
            agents,
            config,
        }
    }

    /// Asks one agent for digests and replaces the server's stored rows.
    pub async fn check_server(&self, server: &Server) -> Result<CheckSummary> {
        let credentials = self.store.list_registry_credentials(server.id)?;
        let request = CheckUpdatesRequest {
            registry_credentials: to_registry_auth(&self.crypto, &credentials)?,
            disabled_registries: self.config.disabled_registries.clone(),
        };

        let client = self.agents.client(server)?;
        let response = client.check_updates(&request).await?;

        let records = records_from(response.results);
        let removed = self
            .store
            .replace_image_updates(server.id, &records, Utc::now())?;

        let summary = CheckSummary {
            stored: records.len(),
            available: records.iter().filter(|r| r.update_available).count(),
            removed,
        };
        info!(
            server_id = server.id,
            stored = summary.stored,
            available = summary.available,
            removed = summary.removed,
            "Image update check finished"
        );
        Ok(summary)
    }

    /// Checks every active server. One failing agent does not stop the others.
    pub async fn check_all(&self) {
        let servers = match self.store.list_active_servers() {
            Ok(servers) => servers,
            Err(e) => {
                warn!("Image update check could not list servers: {e}");
                return;
            }
        };

        for server in &servers {
            if let Err(e) = self.check_server(server).await {
                warn!(server_id = server.id, "Image update check failed: {e}");
            }
        }
    }

    /// Runs checks on the configured interval until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if !self.config.enabled {
            debug!("Image update checks are disabled");
            return;
        }

        info!(interval = ?self.config.interval, "Image update poller started");
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => self.check_all().await,
            }
        }
        info!("Image update poller stopped");
    }

    /// Stored rows for a server, corrected by what its containers run right now.
    pub async fn live_view(&self, server: &Server) -> Result<Vec<ContainerImageUpdate>> {
        let rows = self.store.list_image_updates(server.id)?;
        if rows.is_empty() {
            return Ok(rows);
        }

        let client = self.agents.client(server)?;
        let stacks: BTreeSet<&str> = rows.iter().map(|r| r.stack_name.as_str()).collect();
        let mut details = Vec::with_capacity(stacks.len());
        for stack in stacks {
            match client.get_stack(stack).await {
                Ok(detail) => details.push(detail),
                Err(e) => debug!(server_id = server.id, stack, "Live digest lookup failed: {e}"),
            }
        }

        Ok(reconcile(rows, &live_digests(&details)))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::config::AgentConfig;
    use crate::store::{NewRegistryCredential, NewServer, SqliteStore};

    fn result(stack: &str, container: &str, current: &str, latest: &str) -> ImageCheckResult {
        ImageCheckResult {
            stack_name: stack.into(),
            container_name: container.into(),
            image: "nginx:latest".into(),
            current_repo_digest: current.into(),
            latest_repo_digest: latest.into(),
            error: None,
        }
    }

    #[test]
    fn test_records_skip_unknown_and_flag_updates() {
        let mut failed = result("svc", "svc-3", "sha256:aaa", "");
        failed.error = Some("unauthorized".into());

        let records = records_from(vec![
            result("svc", "svc-1", "nginx@sha256:aaa", "sha256:bbb"),
            result("svc", "svc-2", "", ""),
            failed,
            result("svc", "svc-4", "sha256:ccc", "sha256:ccc"),
        ]);

        assert_eq!(records.len(), 3);
        assert!(records[0].update_available);
        assert!(!records[1].update_available);
        assert_eq!(records[1].check_error.as_deref(), Some("unauthorized"));
        assert!(!records[2].update_available);
    }

    fn stored_row() -> ContainerImageUpdate {
        ContainerImageUpdate {
            id: 1,
            server_id: 2,
            stack_name: "svc".into(),
            container_name: "svc-1".into(),
            current_image_name: "nginx:latest".into(),
            current_repo_digest: "sha256:aaa".into(),
            latest_repo_digest: "sha256:bbb".into(),
            update_available: true,
            last_checked_at: Utc::now(),
            check_error: None,
        }
    }

    #[test]
    fn test_reconcile_uses_live_digest() {
        let mut live = LiveDigests::new();
        live.insert(("svc".into(), "svc-1".into()), "sha256:bbb".into());

        let rows = reconcile(vec![stored_row()], &live);
        assert_eq!(rows[0].current_repo_digest, "sha256:bbb");
        assert!(!rows[0].update_available);

        let untouched = reconcile(vec![stored_row()], &LiveDigests::new());
        assert!(untouched[0].update_available);
    }

    #[test]
    fn test_bare_digest() {
        assert_eq!(bare_digest("nginx@sha256:abc"), "sha256:abc");
        assert_eq!(bare_digest("sha256:abc"), "sha256:abc");
    }

    struct Fixture {
        store: Arc<dyn Store>,
        server: Server,
        service: ImageUpdateService,
    }

    fn fixture(mock: &mockito::ServerGuard, crypto: &Crypto) -> Fixture {
        let db = SqliteStore::in_memory().unwrap();
        db.initialize().unwrap();
        let store: Arc<dyn Store> = Arc::new(db);

        let addr = mock.socket_address();
        let server = store
            .create_server(&NewServer {
                name: "edge".into(),
                description: String::new(),
                host: addr.ip().to_string(),
                port: addr.port(),
                skip_ssl_verification: false,
                access_token: "agent-token".into(),
                is_active: true,
            })
            .unwrap();

        let agents = Arc::new(AgentRegistry::new(AgentConfig {
            use_http: true,
            request_timeout: Duration::from_secs(5),
        }));
        let service = ImageUpdateService::new(
            store.clone(),
            crypto.clone(),
            agents,
            ImageUpdateConfig {
                enabled: true,
                interval: Duration::from_secs(3600),
                disabled_registries: vec!["quay.io".into()],
            },
        );

        Fixture {
            store,
            server,
            service,
        }
    }

    #[tokio::test]
    async fn test_check_server_sends_credentials_and_prunes() {
        let crypto = Crypto::new("0123456789abcdef-test");
        let mut mock = mockito::Server::new_async().await;
        let f = fixture(&mock, &crypto);

        f.store
            .create_registry_credential(&NewRegistryCredential {
                server_id: f.server.id,
                stack_pattern: "*".into(),
                registry_url: "https://ghcr.io/".into(),
                image_pattern: None,
                username: "bot".into(),
                encrypted_password: crypto.encrypt("hunter2").unwrap(),
            })
            .unwrap();

        let first = mock
            .mock("POST", "/images/check-updates")
            .match_body(mockito::Matcher::Json(json!({
                "registry_credentials": [
                    {"registry_url": "ghcr.io", "username": "bot", "password": "hunter2"}
                ],
                "disabled_registries": ["quay.io"]
            })))
            .with_body(
                json!({"results": [
                    {"stack_name": "svc", "container_name": "svc-1", "image": "nginx",
                     "current_repo_digest": "sha256:aaa", "latest_repo_digest": "sha256:bbb"},
                    {"stack_name": "old", "container_name": "old-1", "image": "redis",
                     "current_repo_digest": "sha256:ccc", "latest_repo_digest": "sha256:ccc"}
                ]})
                .to_string(),
            )
            .create_async()
            .await;

        let summary = f.service.check_server(&f.server).await.unwrap();
        first.assert_async().await;
        assert_eq!(
            summary,
            CheckSummary {
                stored: 2,
                available: 1,
                removed: 0
            }
        );
        first.remove_async().await;

        mock.mock("POST", "/images/check-updates")
            .with_body(
                json!({"results": [
                    {"stack_name": "svc", "container_name": "svc-1", "image": "nginx",
                     "current_repo_digest": "sha256:aaa", "latest_repo_digest": "sha256:bbb"}
                ]})
                .to_string(),
            )
            .create_async()
            .await;

        let summary = f.service.check_server(&f.server).await.unwrap();
        assert_eq!(summary.removed, 1);
        let rows = f.store.list_image_updates(f.server.id).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].container_name, "svc-1");
    }

    #[tokio::test]
    async fn test_live_view_reconciles_without_persisting() {
        let crypto = Crypto::new("0123456789abcdef-test");
        let mut mock = mockito::Server::new_async().await;
        let f = fixture(&mock, &crypto);

        f.store
            .replace_image_updates(
                f.server.id,
                &[NewImageUpdate {
                    stack_name: "svc".into(),
                    container_name: "svc-1".into(),
                    current_image_name: "nginx:latest".into(),
                    current_repo_digest: "sha256:aaa".into(),
                    latest_repo_digest: "sha256:bbb".into(),
                    update_available: true,
                    check_error: None,
                }],
                Utc::now(),
            )
            .unwrap();

        mock.mock("GET", "/stacks/svc")
            .with_body(
                json!({"name": "svc", "containers": [
                    {"name": "svc-1", "image": "nginx:latest", "repo_digest": "nginx@sha256:bbb"}
                ]})
                .to_string(),
            )
            .create_async()
            .await;

        let rows = f.service.live_view(&f.server).await.unwrap();
        assert_eq!(rows[0].current_repo_digest, "sha256:bbb");
        assert!(!rows[0].update_available);

        let stored = f.store.list_image_updates(f.server.id).unwrap();
        assert_eq!(stored[0].current_repo_digest, "sha256:aaa");
        assert!(stored[0].update_available);
    }
}
