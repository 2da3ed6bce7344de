use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    Authentication,
    Totp,
    UserManagement,
    Rbac,
    ServerManagement,
    Api,
    File,
    Operation,
}

impl AuditCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditCategory::Authentication => "authentication",
            AuditCategory::Totp => "totp",
            AuditCategory::UserManagement => "user_management",
            AuditCategory::Rbac => "rbac",
            AuditCategory::ServerManagement => "server_management",
            AuditCategory::Api => "api",
            AuditCategory::File => "file",
            AuditCategory::Operation => "operation",
        }
    }
}

/// Security audit event vocabulary. The string form of each variant is part of the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditEventType {
    LoginSuccess,
    LoginFailure,
    Logout,
    SessionRevoked,
    SessionsRevokedAll,
    TotpEnabled,
    TotpDisabled,
    TotpVerificationSuccess,
    TotpVerificationFailure,
    TotpSetupInitiated,
    UserCreated,
    UserDeleted,
    UserPasswordChanged,
    UserEmailChanged,
    UserRoleAssigned,
    UserRoleRevoked,
    RoleCreated,
    RoleUpdated,
    RoleDeleted,
    PermissionAdded,
    PermissionRemoved,
    ServerCreated,
    ServerUpdated,
    ServerDeleted,
    ServerAccessTokenRegenerated,
    ServerConnectionTestSuccess,
    ServerConnectionTestFailure,
    ApiTokenIssued,
    ApiTokenRefreshed,
    ApiTokenRevoked,
    ApiAuthFailed,
    FileUploaded,
    FileDownloaded,
    FileDeleted,
    FileRenamed,
    OperationStarted,
    OperationCompleted,
    OperationFailed,
}

impl AuditEventType {
    pub fn as_str(self) -> &'static str {
        use AuditEventType::*;
        match self {
            LoginSuccess => "auth.login.success",
            LoginFailure => "auth.login.failure",
            Logout => "auth.logout",
            SessionRevoked => "auth.session.revoked",
            SessionsRevokedAll => "auth.sessions.revoked_all",
            TotpEnabled => "totp.enabled",
            TotpDisabled => "totp.disabled",
            TotpVerificationSuccess => "totp.verification.success",
            TotpVerificationFailure => "totp.verification.failure",
            TotpSetupInitiated => "totp.setup.initiated",
            UserCreated => "user.created",
            UserDeleted => "user.deleted",
            UserPasswordChanged => "user.password.changed",
            UserEmailChanged => "user.email.changed",
            UserRoleAssigned => "user.role.assigned",
            UserRoleRevoked => "user.role.revoked",
            RoleCreated => "rbac.role.created",
            RoleUpdated => "rbac.role.updated",
            RoleDeleted => "rbac.role.deleted",
            PermissionAdded => "rbac.permission.added",
            PermissionRemoved => "rbac.permission.removed",
            ServerCreated => "server.created",
            ServerUpdated => "server.updated",
            ServerDeleted => "server.deleted",
            ServerAccessTokenRegenerated => "server.access_token.regenerated",
            ServerConnectionTestSuccess => "server.connection.test_success",
            ServerConnectionTestFailure => "server.connection.test_failure",
            ApiTokenIssued => "api.token.issued",
            ApiTokenRefreshed => "api.token.refreshed",
            ApiTokenRevoked => "api.token.revoked",
            ApiAuthFailed => "api.auth.failed",
            FileUploaded => "file.uploaded",
            FileDownloaded => "file.downloaded",
            FileDeleted => "file.deleted",
            FileRenamed => "file.renamed",
            OperationStarted => "operation.started",
            OperationCompleted => "operation.completed",
            OperationFailed => "operation.failed",
        }
    }

    pub fn category(self) -> AuditCategory {
        use AuditEventType::*;
        match self {
            LoginSuccess | LoginFailure | Logout | SessionRevoked | SessionsRevokedAll => {
                AuditCategory::Authentication
            }
            TotpEnabled
            | TotpDisabled
            | TotpVerificationSuccess
            | TotpVerificationFailure
            | TotpSetupInitiated => AuditCategory::Totp,
            UserCreated | UserDeleted | UserPasswordChanged | UserEmailChanged
            | UserRoleAssigned | UserRoleRevoked => AuditCategory::UserManagement,
            RoleCreated | RoleUpdated | RoleDeleted | PermissionAdded | PermissionRemoved => {
                AuditCategory::Rbac
            }
            ServerCreated
            | ServerUpdated
            | ServerDeleted
            | ServerAccessTokenRegenerated
            | ServerConnectionTestSuccess
            | ServerConnectionTestFailure => AuditCategory::ServerManagement,
            ApiTokenIssued | ApiTokenRefreshed | ApiTokenRevoked | ApiAuthFailed => {
                AuditCategory::Api
            }
            FileUploaded | FileDownloaded | FileDeleted | FileRenamed => AuditCategory::File,
            OperationStarted | OperationCompleted | OperationFailed => AuditCategory::Operation,
        }
    }

    /// Deletes and credential regeneration are critical; failed authentication and
    /// identity or policy changes are high; password and email changes are medium.
    pub fn severity(self) -> Severity {
        use AuditEventType::*;
        match self {
            UserDeleted | RoleDeleted | ServerDeleted | ServerAccessTokenRegenerated
            | FileDeleted => Severity::Critical,
            LoginFailure | TotpVerificationFailure | ApiAuthFailed | UserCreated
            | UserRoleAssigned | UserRoleRevoked | RoleCreated | RoleUpdated
            | PermissionAdded | PermissionRemoved | ServerCreated | ServerUpdated
            | TotpEnabled | TotpDisabled => Severity::High,
            UserPasswordChanged | UserEmailChanged | SessionsRevokedAll
            | ServerConnectionTestFailure | OperationFailed => Severity::Medium,
            LoginSuccess | Logout | SessionRevoked | TotpVerificationSuccess
            | TotpSetupInitiated | ServerConnectionTestSuccess | ApiTokenIssued
            | ApiTokenRefreshed | ApiTokenRevoked | FileUploaded | FileDownloaded
            | FileRenamed | OperationStarted | OperationCompleted => Severity::Low,
        }
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_table() {
        assert_eq!(AuditEventType::UserDeleted.severity(), Severity::Critical);
        assert_eq!(
            AuditEventType::ServerAccessTokenRegenerated.severity(),
            Severity::Critical
        );
        assert_eq!(AuditEventType::ApiAuthFailed.severity(), Severity::High);
        assert_eq!(AuditEventType::UserCreated.severity(), Severity::High);
        assert_eq!(AuditEventType::UserPasswordChanged.severity(), Severity::Medium);
        assert_eq!(AuditEventType::LoginSuccess.severity(), Severity::Low);
    }

    #[test]
    fn test_event_names() {
        assert_eq!(AuditEventType::SessionsRevokedAll.as_str(), "auth.sessions.revoked_all");
        assert_eq!(AuditEventType::TotpVerificationFailure.as_str(), "totp.verification.failure");
        assert_eq!(AuditEventType::ApiTokenIssued.category(), AuditCategory::Api);
    }
}
