//! Security audit trail.
//!
//! Every privileged write goes through [`AuditLogger::record`]: the row is committed to
//! the store first and then handed to the file logger, which is best-effort telemetry.

mod file_logger;

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

pub use file_logger::{FileLogger, LogStream};

use crate::store::{NewAuditLog, Store};
use crate::types::{AuditEventType, OperationLog, OperationLogMessage, SecurityAuditLog};

/// The person (or key) behind an audited action.
#[derive(Debug, Clone, Default)]
pub struct Actor {
    pub user_id: Option<i64>,
    pub username: String,
    pub ip: String,
    pub user_agent: String,
    pub session_id: Option<i64>,
}

impl Actor {
    #[must_use]
    pub fn anonymous(ip: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            user_agent: user_agent.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn system() -> Self {
        Self {
            username: "system".into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditEvent {
    event_type: AuditEventType,
    actor: Actor,
    target_type: String,
    target_id: Option<i64>,
    target_name: String,
    success: bool,
    failure_reason: Option<String>,
    metadata: Value,
    server_id: Option<i64>,
    stack_name: Option<String>,
}

impl AuditEvent {
    #[must_use]
    pub fn new(event_type: AuditEventType, actor: &Actor) -> Self {
        Self {
            event_type,
            actor: actor.clone(),
            target_type: String::new(),
            target_id: None,
            target_name: String::new(),
            success: true,
            failure_reason: None,
            metadata: Value::Object(serde_json::Map::new()),
            server_id: None,
            stack_name: None,
        }
    }

    #[must_use]
    pub fn target(mut self, kind: &str, id: Option<i64>, name: impl Into<String>) -> Self {
        self.target_type = kind.to_string();
        self.target_id = id;
        self.target_name = name.into();
        self
    }

    #[must_use]
    pub fn failed(mut self, reason: impl Into<String>) -> Self {
        self.success = false;
        self.failure_reason = Some(reason.into());
        self
    }

    #[must_use]
    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub fn server(mut self, server_id: i64) -> Self {
        self.server_id = Some(server_id);
        self
    }

    #[must_use]
    pub fn stack(mut self, stack_name: impl Into<String>) -> Self {
        self.stack_name = Some(stack_name.into());
        self
    }
}

pub struct AuditLogger {
    store: Arc<dyn Store>,
    files: Option<Arc<FileLogger>>,
    security_to_file: bool,
    operations_to_file: bool,
}

impl AuditLogger {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        files: Option<Arc<FileLogger>>,
        security_to_file: bool,
        operations_to_file: bool,
    ) -> Self {
        Self {
            store,
            files,
            security_to_file,
            operations_to_file,
        }
    }

    /// Persists an audit event. Failures are logged; they never fail the audited request.
    pub fn record(&self, event: AuditEvent) -> Option<SecurityAuditLog> {
        let entry = NewAuditLog {
            created_at: Utc::now(),
            event_type: event.event_type,
            actor_user_id: event.actor.user_id,
            actor_username: event.actor.username,
            actor_ip: event.actor.ip,
            actor_user_agent: event.actor.user_agent,
            target_type: event.target_type,
            target_id: event.target_id,
            target_name: event.target_name,
            success: event.success,
            failure_reason: event.failure_reason,
            metadata: event.metadata,
            server_id: event.server_id,
            stack_name: event.stack_name,
            session_id: event.actor.session_id,
        };

        match self.store.insert_security_audit_log(&entry) {
            Ok(saved) => {
                if self.security_to_file {
                    if let Some(files) = &self.files {
                        files.log(LogStream::Security, &saved);
                    }
                }
                Some(saved)
            }
            Err(e) => {
                tracing::error!(event_type = %entry.event_type, "Failed to write audit log: {e}");
                None
            }
        }
    }

    /// Mirrors a finished operation and its messages to the operations file stream.
    /// Whether finished operations are mirrored to the operations file stream.
    #[must_use]
    pub fn mirrors_operations(&self) -> bool {
        self.operations_to_file && self.files.is_some()
    }

    pub fn operation_finished(&self, log: &OperationLog, messages: &[OperationLogMessage]) {
        if !self.operations_to_file {
            return;
        }
        if let Some(files) = &self.files {
            files.log(
                LogStream::Operations,
                &serde_json::json!({ "operation": log, "messages": messages }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::store::{AuditLogFilter, SqliteStore};

    fn store() -> Arc<dyn Store> {
        let store = SqliteStore::in_memory().unwrap();
        store.initialize().unwrap();
        Arc::new(store)
    }

    #[test]
    fn test_record_derives_category_and_severity() {
        let db = store();
        let audit = AuditLogger::new(db.clone(), None, false, false);
        let actor = Actor {
            user_id: Some(7),
            username: "alice".into(),
            ip: "10.0.0.9".into(),
            ..Default::default()
        };

        let saved = audit
            .record(
                AuditEvent::new(AuditEventType::ServerDeleted, &actor)
                    .target("server", Some(3), "edge-1")
                    .metadata(json!({"host": "10.0.0.2"})),
            )
            .unwrap();

        assert_eq!(saved.event_type, "server.deleted");
        assert_eq!(saved.event_category, "server_management");
        assert_eq!(saved.severity, "critical");
        assert_eq!(saved.target_name, "edge-1");

        let rows = db
            .list_security_audit_logs(&AuditLogFilter {
                actor_user_id: Some(7),
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_failed_event() {
        let audit = AuditLogger::new(store(), None, false, false);
        let saved = audit
            .record(
                AuditEvent::new(AuditEventType::ApiAuthFailed, &Actor::anonymous("1.2.3.4", "curl"))
                    .failed("invalid_credentials"),
            )
            .unwrap();

        assert!(!saved.success);
        assert_eq!(saved.failure_reason.as_deref(), Some("invalid_credentials"));
        assert_eq!(saved.severity, "high");
    }
}
