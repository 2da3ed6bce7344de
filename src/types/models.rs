use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(skip)]
    pub password_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_verified_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

/// A row of the persisted permission vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRecord {
    pub id: i64,
    pub name: String,
    pub resource: String,
    pub action: String,
    pub description: String,
    pub is_api_key_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub host: String,
    pub port: u16,
    pub skip_ssl_verification: bool,
    #[serde(skip)]
    pub access_token: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Grants `role` the permission on `server` for every stack matching `stack_pattern`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackPermission {
    pub id: i64,
    pub server_id: i64,
    pub role_id: i64,
    pub permission_id: i64,
    pub permission: String,
    pub stack_pattern: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: i64,
    pub user_id: i64,
    #[serde(skip)]
    pub key_hash: String,
    pub prefix: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyScope {
    pub id: i64,
    pub api_key_id: i64,
    pub permission_id: i64,
    pub permission: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<i64>,
    pub stack_pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryCredential {
    pub id: i64,
    pub server_id: i64,
    pub stack_pattern: String,
    pub registry_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_pattern: Option<String>,
    pub username: String,
    #[serde(skip)]
    pub encrypted_password: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerImageUpdate {
    pub id: i64,
    pub server_id: i64,
    pub stack_name: String,
    pub container_name: String,
    pub current_image_name: String,
    pub current_repo_digest: String,
    pub latest_repo_digest: String,
    pub update_available: bool,
    pub last_checked_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshToken {
    pub id: i64,
    pub user_id: i64,
    #[serde(skip)]
    pub token_hash: String,
    /// Shared by every token rotated out of the same login.
    pub family_id: String,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
    pub session_info: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Session,
    Jwt,
}

impl SessionType {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionType::Session => "session",
            SessionType::Jwt => "jwt",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "session" => Some(SessionType::Session),
            "jwt" => Some(SessionType::Jwt),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSession {
    pub id: i64,
    pub user_id: i64,
    #[serde(skip)]
    pub token: String,
    #[serde(rename = "type")]
    pub session_type: SessionType,
    pub ip: String,
    pub user_agent: String,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip)]
    pub jwt_access_jti: Option<String>,
    #[serde(skip)]
    pub refresh_token_id: Option<i64>,
}

impl UserSession {
    /// Session token for a JWT session, derived from its refresh token id so a client
    /// can identify its own session without revealing the refresh token.
    pub fn token_for_refresh_id(refresh_token_id: i64) -> String {
        use sha2::{Digest, Sha256};

        hex::encode(Sha256::digest(format!("refresh_token_id_{refresh_token_id}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationLog {
    pub id: i64,
    pub user_id: i64,
    pub server_id: i64,
    pub stack_name: String,
    pub operation_id: String,
    pub command: String,
    pub options: Vec<String>,
    pub services: Vec<String>,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl OperationLog {
    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Stdout,
    Stderr,
    Progress,
    Complete,
    Error,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Stdout => "stdout",
            MessageKind::Stderr => "stderr",
            MessageKind::Progress => "progress",
            MessageKind::Complete => "complete",
            MessageKind::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stdout" => Some(MessageKind::Stdout),
            "stderr" => Some(MessageKind::Stderr),
            "progress" => Some(MessageKind::Progress),
            "complete" => Some(MessageKind::Complete),
            "error" => Some(MessageKind::Error),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MessageKind::Complete | MessageKind::Error)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationLogMessage {
    pub id: i64,
    pub operation_log_id: i64,
    pub sequence: i64,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityAuditLog {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub event_type: String,
    pub event_category: String,
    pub severity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_user_id: Option<i64>,
    pub actor_username: String,
    pub actor_ip: String,
    pub actor_user_agent: String,
    pub target_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<i64>,
    pub target_name: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub metadata: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct TotpSecret {
    pub user_id: i64,
    pub encrypted_secret: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub enabled_at: Option<DateTime<Utc>>,
}
