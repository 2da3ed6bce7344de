mod schema;
mod sqlite;

pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::*;

pub const ADMIN_ROLE_NAME: &str = "admin";

#[derive(Debug, Clone)]
pub struct NewServer {
    pub name: String,
    pub description: String,
    pub host: String,
    pub port: u16,
    pub skip_ssl_verification: bool,
    pub access_token: String,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct NewRegistryCredential {
    pub server_id: i64,
    pub stack_pattern: String,
    pub registry_url: String,
    pub image_pattern: Option<String>,
    pub username: String,
    pub encrypted_password: String,
}

#[derive(Debug, Clone)]
pub struct NewImageUpdate {
    pub stack_name: String,
    pub container_name: String,
    pub current_image_name: String,
    pub current_repo_digest: String,
    pub latest_repo_digest: String,
    pub update_available: bool,
    pub check_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewRefreshToken {
    pub user_id: i64,
    pub token_hash: String,
    pub family_id: String,
    pub expires_at: DateTime<Utc>,
    pub session_info: String,
}

#[derive(Debug, Clone)]
pub struct NewSession {
    pub user_id: i64,
    pub token: String,
    pub session_type: SessionType,
    pub ip: String,
    pub user_agent: String,
    pub expires_at: DateTime<Utc>,
    pub jwt_access_jti: Option<String>,
    pub refresh_token_id: Option<i64>,
}

/// Session fields rewritten when its refresh token rotates.
#[derive(Debug, Clone)]
pub struct SessionRotation {
    pub jwt_access_jti: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewOperationLog {
    pub user_id: i64,
    pub server_id: i64,
    pub stack_name: String,
    pub operation_id: String,
    pub command: String,
    pub options: Vec<String>,
    pub services: Vec<String>,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewOperationMessage {
    pub sequence: i64,
    pub timestamp: DateTime<Utc>,
    pub kind: MessageKind,
    pub data: String,
    pub exit_code: Option<i32>,
    pub success: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct OperationOutcome {
    pub end_time: DateTime<Utc>,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct OperationLogFilter {
    pub user_id: Option<i64>,
    pub server_id: Option<i64>,
    pub stack_name: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone)]
pub struct NewAuditLog {
    pub created_at: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub actor_user_id: Option<i64>,
    pub actor_username: String,
    pub actor_ip: String,
    pub actor_user_agent: String,
    pub target_type: String,
    pub target_id: Option<i64>,
    pub target_name: String,
    pub success: bool,
    pub failure_reason: Option<String>,
    pub metadata: serde_json::Value,
    pub server_id: Option<i64>,
    pub stack_name: Option<String>,
    pub session_id: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct AuditLogFilter {
    pub event_type: Option<String>,
    pub event_category: Option<String>,
    pub severity: Option<String>,
    pub actor_user_id: Option<i64>,
    pub limit: i64,
    pub offset: i64,
}

/// Store defines the database interface.
pub trait Store: Send + Sync {
    /// Creates the schema and seeds the permission vocabulary and the admin role.
    fn initialize(&self) -> Result<()>;

    // User operations
    fn create_user(&self, username: &str, email: &str, password_hash: &str) -> Result<User>;
    fn get_user(&self, id: i64) -> Result<Option<User>>;
    fn get_user_by_username(&self, username: &str) -> Result<Option<User>>;
    fn list_users(&self) -> Result<Vec<User>>;
    fn count_users(&self) -> Result<i64>;
    fn update_user_password(&self, id: i64, password_hash: &str) -> Result<()>;
    fn update_user_email(&self, id: i64, email: &str, verified_at: Option<DateTime<Utc>>)
    -> Result<()>;
    fn update_user_last_login(&self, id: i64) -> Result<()>;
    fn delete_user(&self, id: i64) -> Result<bool>;

    // Role operations
    fn create_role(&self, name: &str, description: &str, is_admin: bool) -> Result<Role>;
    fn get_role(&self, id: i64) -> Result<Option<Role>>;
    fn get_role_by_name(&self, name: &str) -> Result<Option<Role>>;
    fn list_roles(&self) -> Result<Vec<Role>>;
    fn update_role(&self, id: i64, name: &str, description: &str) -> Result<()>;
    fn delete_role(&self, id: i64) -> Result<bool>;

    // User-Role M2M operations
    fn assign_role(&self, user_id: i64, role_id: i64) -> Result<bool>;
    fn revoke_role(&self, user_id: i64, role_id: i64) -> Result<bool>;
    fn list_user_roles(&self, user_id: i64) -> Result<Vec<Role>>;
    fn user_is_admin(&self, user_id: i64) -> Result<bool>;

    // Permission vocabulary and grants
    fn list_permissions(&self) -> Result<Vec<PermissionRecord>>;
    fn get_permission_by_name(&self, name: &str) -> Result<Option<PermissionRecord>>;
    fn add_role_permission(&self, role_id: i64, permission_id: i64) -> Result<bool>;
    fn remove_role_permission(&self, role_id: i64, permission_id: i64) -> Result<bool>;
    fn list_role_permissions(&self, role_id: i64) -> Result<Vec<PermissionRecord>>;
    fn user_has_role_permission(&self, user_id: i64, permission: &str) -> Result<bool>;
    fn add_stack_permission(
        &self,
        server_id: i64,
        role_id: i64,
        permission_id: i64,
        stack_pattern: &str,
    ) -> Result<StackPermission>;
    fn delete_stack_permission(&self, role_id: i64, id: i64) -> Result<bool>;
    fn list_role_stack_permissions(&self, role_id: i64) -> Result<Vec<StackPermission>>;
    /// Grants reachable by the user through any of their roles, optionally limited to one server.
    fn list_user_stack_permissions(
        &self,
        user_id: i64,
        server_id: Option<i64>,
    ) -> Result<Vec<StackPermission>>;

    // Server operations
    fn create_server(&self, server: &NewServer) -> Result<Server>;
    fn get_server(&self, id: i64) -> Result<Option<Server>>;
    fn list_servers(&self) -> Result<Vec<Server>>;
    fn list_active_servers(&self) -> Result<Vec<Server>>;
    fn update_server(&self, server: &Server) -> Result<()>;
    fn update_server_access_token(&self, id: i64, access_token: &str) -> Result<()>;
    fn delete_server(&self, id: i64) -> Result<bool>;

    // API key operations
    fn create_api_key(
        &self,
        user_id: i64,
        name: &str,
        prefix: &str,
        key_hash: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<ApiKey>;
    fn get_api_key(&self, id: i64) -> Result<Option<ApiKey>>;
    fn get_api_key_by_prefix(&self, prefix: &str) -> Result<Option<ApiKey>>;
    fn list_user_api_keys(&self, user_id: i64) -> Result<Vec<ApiKey>>;
    fn delete_api_key(&self, id: i64) -> Result<bool>;
    fn update_api_key_last_used(&self, id: i64) -> Result<()>;
    fn add_api_key_scope(
        &self,
        api_key_id: i64,
        permission_id: i64,
        server_id: Option<i64>,
        stack_pattern: &str,
    ) -> Result<ApiKeyScope>;
    fn list_api_key_scopes(&self, api_key_id: i64) -> Result<Vec<ApiKeyScope>>;
    fn delete_api_key_scope(&self, api_key_id: i64, scope_id: i64) -> Result<bool>;

    // Registry credential operations
    fn create_registry_credential(
        &self,
        credential: &NewRegistryCredential,
    ) -> Result<RegistryCredential>;
    fn get_registry_credential(&self, server_id: i64, id: i64)
    -> Result<Option<RegistryCredential>>;
    fn list_registry_credentials(&self, server_id: i64) -> Result<Vec<RegistryCredential>>;
    fn update_registry_credential(&self, credential: &RegistryCredential) -> Result<()>;
    fn delete_registry_credential(&self, server_id: i64, id: i64) -> Result<bool>;

    // Image update operations
    /// Upserts every record and deletes the server's rows absent from `records`, atomically.
    /// Returns the number of stale rows removed.
    fn replace_image_updates(
        &self,
        server_id: i64,
        records: &[NewImageUpdate],
        checked_at: DateTime<Utc>,
    ) -> Result<usize>;
    fn list_image_updates(&self, server_id: i64) -> Result<Vec<ContainerImageUpdate>>;
    fn list_all_image_updates(&self) -> Result<Vec<ContainerImageUpdate>>;

    // Refresh token operations
    fn create_refresh_token(&self, token: &NewRefreshToken) -> Result<RefreshToken>;
    fn get_refresh_token_by_hash(&self, token_hash: &str) -> Result<Option<RefreshToken>>;
    /// Revokes `old_id` and inserts `new_token` in one transaction, repointing the linked
    /// session. Returns `None` when `old_id` was already revoked.
    fn rotate_refresh_token(
        &self,
        old_id: i64,
        new_token: &NewRefreshToken,
        session: &SessionRotation,
    ) -> Result<Option<RefreshToken>>;
    fn revoke_refresh_token(&self, id: i64) -> Result<bool>;
    /// Revokes the whole family and deletes its sessions. Returns the access JTIs of the
    /// deleted sessions.
    fn revoke_refresh_family(&self, family_id: &str) -> Result<Vec<String>>;
    fn delete_expired_refresh_tokens(&self, now: DateTime<Utc>) -> Result<usize>;

    // Access token revocation
    fn insert_revoked_token(&self, jti: &str, expires_at: DateTime<Utc>) -> Result<()>;
    fn list_revoked_tokens(&self) -> Result<Vec<(String, DateTime<Utc>)>>;
    fn delete_expired_revoked_tokens(&self, now: DateTime<Utc>) -> Result<usize>;

    // Session operations
    fn create_session(&self, session: &NewSession) -> Result<UserSession>;
    fn get_session(&self, id: i64) -> Result<Option<UserSession>>;
    fn get_session_by_token(&self, token: &str) -> Result<Option<UserSession>>;
    fn get_session_by_jti(&self, jti: &str) -> Result<Option<UserSession>>;
    fn get_session_by_refresh_id(&self, refresh_token_id: i64) -> Result<Option<UserSession>>;
    fn list_user_sessions(&self, user_id: i64) -> Result<Vec<UserSession>>;
    fn touch_session(&self, id: i64) -> Result<()>;
    fn delete_session(&self, id: i64) -> Result<bool>;
    fn delete_user_sessions(&self, user_id: i64, keep_id: Option<i64>) -> Result<Vec<UserSession>>;
    fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize>;

    // TOTP operations
    fn get_totp(&self, user_id: i64) -> Result<Option<TotpSecret>>;
    fn upsert_pending_totp(&self, user_id: i64, encrypted_secret: &str) -> Result<()>;
    fn enable_totp(&self, user_id: i64) -> Result<bool>;
    fn delete_totp(&self, user_id: i64) -> Result<bool>;
    /// Records a consumed code window. Returns false if it was already used.
    fn record_totp_window(&self, user_id: i64, window: i64) -> Result<bool>;
    fn delete_totp_windows_before(&self, window: i64) -> Result<usize>;

    // Operation log operations
    fn create_operation_log(&self, log: &NewOperationLog) -> Result<OperationLog>;
    fn get_operation_log(&self, id: i64) -> Result<Option<OperationLog>>;
    fn get_operation_log_by_operation_id(&self, operation_id: &str)
    -> Result<Option<OperationLog>>;
    fn list_operation_logs(&self, filter: &OperationLogFilter) -> Result<Vec<OperationLog>>;
    fn append_operation_message(
        &self,
        operation_log_id: i64,
        message: &NewOperationMessage,
    ) -> Result<OperationLogMessage>;
    fn list_operation_messages(&self, operation_log_id: i64) -> Result<Vec<OperationLogMessage>>;
    fn finish_operation_log(&self, id: i64, outcome: &OperationOutcome) -> Result<()>;
    fn delete_operation_logs_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    // Security audit log operations
    fn insert_security_audit_log(&self, log: &NewAuditLog) -> Result<SecurityAuditLog>;
    fn list_security_audit_logs(&self, filter: &AuditLogFilter) -> Result<Vec<SecurityAuditLog>>;

    fn close(&self) -> Result<()>;
}
