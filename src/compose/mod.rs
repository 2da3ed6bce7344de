//! Structured edits over compose files stored on an agent.

mod document;
pub mod image;
mod patch;
mod ports;
mod volumes;

pub use document::{ComposeDocument, ResourceKind};
pub use patch::{
    CommandPatch, ComposeChanges, KeyChanges, RestartPolicy, ServiceImageUpdate, ServicePatch,
    apply, apply_image_updates, validate_service_name,
};
pub use ports::{PortInput, PortMapping, normalize_ports, parse_port};
pub use volumes::{MountType, VolumeInput, VolumeMount, normalize_volumes, parse_volume};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::agent::AgentClient;
use crate::error::Result;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PatchRequest {
    #[serde(default)]
    pub changes: ComposeChanges,
    #[serde(default)]
    pub preview: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageUpdateRequest {
    pub updates: Vec<ServiceImageUpdate>,
    #[serde(default)]
    pub preview: bool,
}

/// Result of a patch. `modified_yaml` is what was (or would be) written.
#[derive(Debug, Clone, Serialize)]
pub struct ComposePreview {
    pub success: bool,
    pub original_yaml: String,
    pub modified_yaml: String,
    pub written: bool,
}

/// Fetches the stack's compose file, applies `request.changes`, and writes it back
/// unless previewing. The agent copy is untouched whenever an error is returned.
pub async fn patch_stack(
    client: &AgentClient,
    stack: &str,
    request: &PatchRequest,
) -> Result<ComposePreview> {
    let current = ComposeDocument::parse(&client.get_compose(stack).await?)?;
    let next = apply(&current, &request.changes)?;
    let write = !request.preview && !request.changes.is_empty();
    finish(client, stack, &current, &next, write).await
}

/// Legacy image bump used by scripted clients.
pub async fn update_images(
    client: &AgentClient,
    stack: &str,
    request: &ImageUpdateRequest,
) -> Result<ComposePreview> {
    let current = ComposeDocument::parse(&client.get_compose(stack).await?)?;
    let next = apply_image_updates(&current, &request.updates)?;
    let write = !request.preview && !request.updates.is_empty();
    finish(client, stack, &current, &next, write).await
}

async fn finish(
    client: &AgentClient,
    stack: &str,
    current: &ComposeDocument,
    next: &ComposeDocument,
    write: bool,
) -> Result<ComposePreview> {
    let original_yaml = current.to_yaml()?;
    let modified_yaml = next.to_yaml()?;

    let written = write && next != current;
    if written {
        client.put_compose(stack, &modified_yaml).await?;
        info!(server_id = client.server_id(), stack, "compose file updated");
    }

    Ok(ComposePreview {
        success: true,
        original_yaml,
        modified_yaml,
        written,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::config::AgentConfig;
    use crate::error::Error;
    use crate::types::Server;

    const WEB: &str = "services:\n  web:\n    image: nginx:1.25\n    ports:\n      - \"8080:80\"\n";

    fn doc(yaml: &str) -> ComposeDocument {
        ComposeDocument::parse(yaml).unwrap()
    }

    fn changes(value: serde_json::Value) -> ComposeChanges {
        serde_json::from_value(value).unwrap()
    }

    fn compose_error(result: Result<ComposeDocument>) -> String {
        match result {
            Err(Error::Compose(message)) => message,
            other => panic!("expected compose error, got {other:?}"),
        }
    }

    #[test]
    fn test_image_change_keeps_everything_else() {
        let original = doc(WEB);
        let next = apply(
            &original,
            &changes(json!({"service_changes": {"web": {"image": "nginx:1.27"}}})),
        )
        .unwrap();

        let before = original.to_yaml().unwrap();
        let after = next.to_yaml().unwrap();
        assert_eq!(after, before.replace("nginx:1.25", "nginx:1.27"));
        assert_eq!(original, doc(WEB));
    }

    #[test]
    fn test_mutation_errors() {
        let base = doc(
            "services:\n  web:\n    image: nginx\n    volumes:\n      - data:/data\nvolumes:\n  data: {}\nnetworks:\n  default: {}\n",
        );

        let missing = compose_error(apply(
            &base,
            &changes(json!({"service_changes": {"api": {"image": "x"}}})),
        ));
        assert_eq!(missing, "service 'api' not found");

        let default_net = compose_error(apply(
            &base,
            &changes(json!({"network_changes": {"default": null}})),
        ));
        assert_eq!(default_net, "cannot delete default network");

        let in_use = compose_error(apply(
            &base,
            &changes(json!({"volume_changes": {"data": null}})),
        ));
        assert!(in_use.contains("still used by service 'web'"), "{in_use}");

        let all_gone = compose_error(apply(&base, &changes(json!({"delete_services": ["web"]}))));
        assert_eq!(all_gone, "cannot delete every service");

        let duplicate = compose_error(apply(
            &base,
            &changes(json!({"add_services": {"web": {"image": "redis"}}})),
        ));
        assert_eq!(duplicate, "service 'web' already exists");
    }

    #[test]
    fn test_extends_services_stay_patchable() {
        let base = doc(
            "services:\n  web:\n    image: nginx:1.25\n  worker:\n    extends:\n      file: common.yml\n      service: base\n",
        );
        let next = apply(
            &base,
            &changes(json!({"service_changes": {"web": {"image": "nginx:1.27"}}})),
        )
        .unwrap();
        assert!(next.service("worker").unwrap().contains_key("extends"));

        let bare = compose_error(apply(
            &base,
            &changes(json!({"add_services": {"cron": {"command": "true"}}})),
        ));
        assert!(bare.contains("service 'cron' needs an image"), "{bare}");
    }

    #[test]
    fn test_rename_updates_dependents() {
        let base = doc(
            "services:\n  db:\n    image: postgres:16\n  api:\n    image: api:1\n    depends_on:\n      - db\n",
        );
        let next = apply(&base, &changes(json!({"rename_services": {"db": "postgres"}}))).unwrap();

        assert_eq!(next.service_names(), vec!["postgres", "api"]);
        let api = next.service("api").unwrap();
        assert_eq!(api["depends_on"][0], serde_yaml::Value::String("postgres".into()));
    }

    #[test]
    fn test_environment_set_and_remove() {
        let base = doc(
            "services:\n  web:\n    image: nginx\n    environment:\n      - A=1\n      - B=2\n",
        );
        let next = apply(
            &base,
            &changes(json!({"service_changes": {"web": {"environment": {"A": null, "C": 3}}}})),
        )
        .unwrap();

        let env = next.service("web").unwrap()["environment"]
            .as_mapping()
            .unwrap()
            .clone();
        assert!(!env.contains_key("A"));
        assert_eq!(env["B"], serde_yaml::Value::String("2".into()));
        assert_eq!(env["C"], serde_yaml::Value::String("3".into()));
    }

    #[test]
    fn test_ports_and_volumes_are_normalized() {
        let base = doc("services:\n  web:\n    image: nginx\n");
        let next = apply(
            &base,
            &changes(json!({
                "service_changes": {"web": {
                    "ports": ["8443:443", {"target": 80, "published": 8080}],
                    "volumes": ["./html:/usr/share/nginx/html:ro"],
                    "restart": "unless-stopped"
                }}
            })),
        )
        .unwrap();

        let web = next.service("web").unwrap();
        assert_eq!(web["ports"][0]["published"], serde_yaml::Value::String("8443".into()));
        assert_eq!(web["volumes"][0]["type"], serde_yaml::Value::String("bind".into()));
        assert_eq!(web["restart"], serde_yaml::Value::String("unless-stopped".into()));
    }

    #[test]
    fn test_reparse_is_stable() {
        let base = doc(WEB);
        let next = apply(
            &base,
            &changes(json!({
                "add_services": {"cache": {"image": "redis:7", "networks": ["backend"]}},
                "network_changes": {"backend": {"driver": "bridge"}}
            })),
        )
        .unwrap();

        let yaml = next.to_yaml().unwrap();
        let again = doc(&yaml);
        assert_eq!(again, next);
        assert_eq!(again.to_yaml().unwrap(), yaml);
    }

    #[test]
    fn test_undefined_references_fail_validation() {
        let base = doc(WEB);
        let err = compose_error(apply(
            &base,
            &changes(json!({"add_services": {"cache": {"image": "redis", "networks": ["nope"]}}})),
        ));
        assert_eq!(err, "service 'cache' uses undefined network 'nope'");
    }

    #[test]
    fn test_image_updates_by_tag_or_reference() {
        let base = doc("services:\n  web:\n    image: ghcr.io/acme/web:1.0\n  db:\n    image: postgres:15\n");
        let updates: Vec<ServiceImageUpdate> = serde_json::from_value(json!([
            {"service_name": "web", "new_tag": "1.1"},
            {"service_name": "db", "new_image": "postgres:16"}
        ]))
        .unwrap();

        let next = apply_image_updates(&base, &updates).unwrap();
        assert_eq!(
            next.service("web").unwrap()["image"],
            serde_yaml::Value::String("ghcr.io/acme/web:1.1".into())
        );
        assert_eq!(
            next.service("db").unwrap()["image"],
            serde_yaml::Value::String("postgres:16".into())
        );
    }

    fn server_for(mock: &mockito::ServerGuard) -> Server {
        let addr = mock.socket_address();
        Server {
            id: 1,
            name: "local".into(),
            description: String::new(),
            host: addr.ip().to_string(),
            port: addr.port(),
            skip_ssl_verification: false,
            access_token: "t".into(),
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn client_for(mock: &mockito::ServerGuard) -> AgentClient {
        let config = AgentConfig {
            use_http: true,
            request_timeout: Duration::from_secs(5),
        };
        AgentClient::new(&server_for(mock), &config).unwrap()
    }

    #[tokio::test]
    async fn test_preview_does_not_write() {
        let mut mock = mockito::Server::new_async().await;
        mock.mock("GET", "/stacks/web/compose")
            .with_body(json!({"content": WEB}).to_string())
            .create_async()
            .await;
        let write = mock
            .mock("PATCH", "/stacks/web/compose")
            .expect(0)
            .create_async()
            .await;

        let request: PatchRequest = serde_json::from_value(json!({
            "changes": {"service_changes": {"web": {"image": "nginx:1.27"}}},
            "preview": true
        }))
        .unwrap();
        let preview = patch_stack(&client_for(&mock), "web", &request).await.unwrap();

        write.assert_async().await;
        assert!(preview.success);
        assert!(!preview.written);
        assert!(preview.original_yaml.contains("nginx:1.25"));
        assert!(preview.modified_yaml.contains("nginx:1.27"));
    }

    #[tokio::test]
    async fn test_apply_writes_once_and_empty_patch_writes_nothing() {
        let mut mock = mockito::Server::new_async().await;
        mock.mock("GET", "/stacks/web/compose")
            .with_body(json!({"content": WEB}).to_string())
            .expect(2)
            .create_async()
            .await;
        let write = mock
            .mock("PATCH", "/stacks/web/compose")
            .match_body(mockito::Matcher::Regex("nginx:1.27".into()))
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&mock);
        let request: PatchRequest = serde_json::from_value(json!({
            "changes": {"service_changes": {"web": {"image": "nginx:1.27"}}}
        }))
        .unwrap();
        assert!(patch_stack(&client, "web", &request).await.unwrap().written);

        let empty = PatchRequest::default();
        assert!(!patch_stack(&client, "web", &empty).await.unwrap().written);

        write.assert_async().await;
    }

    #[tokio::test]
    async fn test_invalid_patch_leaves_agent_untouched() {
        let mut mock = mockito::Server::new_async().await;
        mock.mock("GET", "/stacks/web/compose")
            .with_body(json!({"content": WEB}).to_string())
            .create_async()
            .await;
        let write = mock
            .mock("PATCH", "/stacks/web/compose")
            .expect(0)
            .create_async()
            .await;

        let request: PatchRequest = serde_json::from_value(json!({
            "changes": {"delete_services": ["web"]}
        }))
        .unwrap();
        assert!(patch_stack(&client_for(&mock), "web", &request).await.is_err());
        write.assert_async().await;
    }
}
