//! Wire types exchanged with agents.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::MessageKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackSummary {
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackDetail {
    pub name: String,
    #[serde(default)]
    pub containers: Vec<ContainerInfo>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeContent {
    pub content: String,
}

/// Credentials handed to an agent for a single registry host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryAuth {
    pub registry_url: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartOperation<'a> {
    pub operation_id: &'a str,
    pub command: &'a str,
    pub options: &'a [String],
    pub services: &'a [String],
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub registry_credentials: Vec<RegistryAuth>,
}

/// One NDJSON line of an operation stream.
#[derive(Debug, Clone, Deserialize)]
pub struct OperationFrame {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckUpdatesRequest {
    pub registry_credentials: Vec<RegistryAuth>,
    pub disabled_registries: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageCheckResult {
    pub stack_name: String,
    pub container_name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub current_repo_digest: String,
    #[serde(default)]
    pub latest_repo_digest: String,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckUpdatesResponse {
    #[serde(default)]
    pub results: Vec<ImageCheckResult>,
}

/// A frame pushed by an agent over its status socket.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl AgentEvent {
    #[must_use]
    pub fn stack_name(&self) -> Option<&str> {
        self.data.get("stack_name").and_then(Value::as_str)
    }

    #[must_use]
    pub fn operation_id(&self) -> Option<&str> {
        self.data.get("operation_id").and_then(Value::as_str)
    }
}
