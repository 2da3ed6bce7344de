use serde::{Deserialize, Serialize};

use crate::server::response::DEFAULT_PAGE_SIZE;
use crate::types::{
    ApiKey, ApiKeyScope, OperationLog, OperationLogMessage, PermissionRecord, Role, Server,
    StackPermission, User,
};

fn any_stack() -> String {
    "*".to_string()
}

fn default_limit() -> i64 {
    DEFAULT_PAGE_SIZE
}

fn default_true() -> bool {
    true
}

// Auth

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct TotpCodeRequest {
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct TotpDisableRequest {
    pub code: String,
    pub password: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogoutRequest {
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LogoutResponse {
    pub revoked_tokens: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct CookieSessionResponse {
    pub user: User,
    pub csrf_token: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangeEmailRequest {
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct ProfileResponse {
    #[serde(flatten)]
    pub user: User,
    pub roles: Vec<Role>,
    pub is_admin: bool,
    pub permissions: Vec<&'static str>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionListRequest {
    /// Marks the session holding this refresh token as current.
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RevokeSessionRequest {
    pub session_id: i64,
}

#[derive(Debug, Serialize)]
pub struct RevokedCount {
    pub revoked: usize,
}

// Servers and stacks

#[derive(Debug, Serialize)]
pub struct ServerView {
    #[serde(flatten)]
    pub server: Server,
    pub connected: bool,
}

#[derive(Debug, Default, Serialize)]
pub struct ServerStatistics {
    pub server_id: i64,
    pub total_stacks: usize,
    pub total_containers: usize,
    pub running_containers: usize,
    pub stopped_containers: usize,
    pub images_with_updates: usize,
}

#[derive(Debug, Deserialize)]
pub struct CreateStackRequest {
    pub name: String,
    pub compose: String,
}

#[derive(Debug, Serialize)]
pub struct StackPermissions {
    pub server_id: i64,
    pub stack_name: String,
    pub permissions: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedOperation {
    pub operation_id: String,
    pub log: OperationLog,
}

#[derive(Debug, Serialize)]
pub struct OperationDetail {
    #[serde(flatten)]
    pub log: OperationLog,
    pub running: bool,
    pub messages: Vec<OperationLogMessage>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FileQuery {
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct FileRenameRequest {
    pub from: String,
    pub to: String,
}

// API keys

#[derive(Debug, Clone, Deserialize)]
pub struct ScopeRequest {
    pub permission: String,
    #[serde(default)]
    pub server_id: Option<i64>,
    #[serde(default = "any_stack")]
    pub stack_pattern: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateApiKeyRequest {
    pub name: String,
    #[serde(default)]
    pub expires_in_days: Option<i64>,
    #[serde(default)]
    pub scopes: Vec<ScopeRequest>,
}

#[derive(Debug, Serialize)]
pub struct ApiKeyView {
    #[serde(flatten)]
    pub key: ApiKey,
    pub scopes: Vec<ApiKeyScope>,
}

#[derive(Debug, Serialize)]
pub struct CreatedApiKey {
    /// Shown once; only a hash is stored.
    pub key: String,
    #[serde(flatten)]
    pub view: ApiKeyView,
}

// Registries

#[derive(Debug, Deserialize)]
pub struct CreateRegistryRequest {
    #[serde(default = "any_stack")]
    pub stack_pattern: String,
    pub registry_url: String,
    #[serde(default)]
    pub image_pattern: Option<String>,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateRegistryRequest {
    pub stack_pattern: Option<String>,
    pub registry_url: Option<String>,
    pub image_pattern: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

// Admin

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub role_ids: Vec<i64>,
}

#[derive(Debug, Serialize)]
pub struct UserView {
    #[serde(flatten)]
    pub user: User,
    pub roles: Vec<Role>,
}

#[derive(Debug, Deserialize)]
pub struct AssignRoleRequest {
    pub role_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct CreateRoleRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_admin: bool,
}

#[derive(Debug, Deserialize)]
pub struct UpdateRoleRequest {
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RoleView {
    #[serde(flatten)]
    pub role: Role,
    pub permissions: Vec<PermissionRecord>,
    pub stack_permissions: Vec<StackPermission>,
}

#[derive(Debug, Deserialize)]
pub struct RolePermissionRequest {
    pub permission: String,
}

#[derive(Debug, Deserialize)]
pub struct StackPermissionRequest {
    pub server_id: i64,
    pub permission: String,
    #[serde(default = "any_stack")]
    pub stack_pattern: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateServerRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub skip_ssl_verification: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Generated when omitted.
    #[serde(default)]
    pub access_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateServerRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub skip_ssl_verification: Option<bool>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct ServerWithToken {
    #[serde(flatten)]
    pub server: Server,
    pub access_token: String,
}

#[derive(Debug, Serialize)]
pub struct ConnectionTest {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OperationLogQuery {
    pub user_id: Option<i64>,
    pub server_id: Option<i64>,
    pub stack_name: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Deserialize)]
pub struct AuditLogQuery {
    pub event_type: Option<String>,
    pub event_category: Option<String>,
    pub severity: Option<String>,
    pub actor_user_id: Option<i64>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Deserialize)]
pub struct ExportRequest {
    pub passphrase: String,
}

/// Plaintext body of an export bundle before encryption.
#[derive(Debug, Serialize)]
pub struct ExportSnapshot {
    pub exported_at: chrono::DateTime<chrono::Utc>,
    pub users: Vec<UserView>,
    pub roles: Vec<RoleView>,
    pub servers: Vec<Server>,
}
