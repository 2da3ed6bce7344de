use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, ToSql, params, params_from_iter};

use super::schema::SCHEMA;
use super::{
    ADMIN_ROLE_NAME, AuditLogFilter, NewAuditLog, NewImageUpdate, NewOperationLog,
    NewOperationMessage, NewRefreshToken, NewRegistryCredential, NewServer, NewSession,
    OperationLogFilter, OperationOutcome, SessionRotation, Store,
};
use crate::error::{Error, Result};
use crate::types::*;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns a guard to the underlying database connection.
    /// This allows consuming applications to execute custom SQL.
    pub fn connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn()
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // Handle SQLite's default datetime format: "YYYY-MM-DD HH:MM:SS"
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            tracing::error!("Invalid datetime in database: '{}' - {}", s, e);
            Utc::now()
        })
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|s| parse_datetime(&s))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Maps a unique-constraint failure to `AlreadyExists`.
fn unique(e: rusqlite::Error) -> Error {
    if is_constraint_violation(&e) {
        Error::AlreadyExists
    } else {
        Error::from(e)
    }
}

const USER_COLUMNS: &str =
    "id, username, email, password_hash, email_verified_at, last_login_at, created_at, updated_at";

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        email_verified_at: parse_optional_datetime(row.get(4)?),
        last_login_at: parse_optional_datetime(row.get(5)?),
        created_at: parse_datetime(&row.get::<_, String>(6)?),
        updated_at: parse_datetime(&row.get::<_, String>(7)?),
    })
}

const ROLE_COLUMNS: &str = "id, name, description, is_admin, created_at";

fn role_from_row(row: &Row<'_>) -> rusqlite::Result<Role> {
    Ok(Role {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        is_admin: row.get(3)?,
        created_at: parse_datetime(&row.get::<_, String>(4)?),
    })
}

const PERMISSION_COLUMNS: &str = "id, name, resource, action, description, is_api_key_only";

fn permission_from_row(row: &Row<'_>) -> rusqlite::Result<PermissionRecord> {
    Ok(PermissionRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        resource: row.get(2)?,
        action: row.get(3)?,
        description: row.get(4)?,
        is_api_key_only: row.get(5)?,
    })
}

const SERVER_COLUMNS: &str = "id, name, description, host, port, skip_ssl_verification, access_token, is_active, created_at, updated_at";

fn server_from_row(row: &Row<'_>) -> rusqlite::Result<Server> {
    Ok(Server {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        host: row.get(3)?,
        port: row.get(4)?,
        skip_ssl_verification: row.get(5)?,
        access_token: row.get(6)?,
        is_active: row.get(7)?,
        created_at: parse_datetime(&row.get::<_, String>(8)?),
        updated_at: parse_datetime(&row.get::<_, String>(9)?),
    })
}

const STACK_PERMISSION_SELECT: &str = "SELECT s.id, s.server_id, s.role_id, s.permission_id, p.name, s.stack_pattern, s.created_at
     FROM server_role_stack_permissions s
     JOIN permissions p ON p.id = s.permission_id";

fn stack_permission_from_row(row: &Row<'_>) -> rusqlite::Result<StackPermission> {
    Ok(StackPermission {
        id: row.get(0)?,
        server_id: row.get(1)?,
        role_id: row.get(2)?,
        permission_id: row.get(3)?,
        permission: row.get(4)?,
        stack_pattern: row.get(5)?,
        created_at: parse_datetime(&row.get::<_, String>(6)?),
    })
}

const API_KEY_COLUMNS: &str =
    "id, user_id, key_hash, prefix, name, last_used_at, expires_at, created_at";

fn api_key_from_row(row: &Row<'_>) -> rusqlite::Result<ApiKey> {
    Ok(ApiKey {
        id: row.get(0)?,
        user_id: row.get(1)?,
        key_hash: row.get(2)?,
        prefix: row.get(3)?,
        name: row.get(4)?,
        last_used_at: parse_optional_datetime(row.get(5)?),
        expires_at: parse_optional_datetime(row.get(6)?),
        created_at: parse_datetime(&row.get::<_, String>(7)?),
    })
}

const API_KEY_SCOPE_SELECT: &str =
    "SELECT s.id, s.api_key_id, s.permission_id, p.name, s.server_id, s.stack_pattern
     FROM api_key_scopes s
     JOIN permissions p ON p.id = s.permission_id";

fn api_key_scope_from_row(row: &Row<'_>) -> rusqlite::Result<ApiKeyScope> {
    Ok(ApiKeyScope {
        id: row.get(0)?,
        api_key_id: row.get(1)?,
        permission_id: row.get(2)?,
        permission: row.get(3)?,
        server_id: row.get(4)?,
        stack_pattern: row.get(5)?,
    })
}

const REGISTRY_COLUMNS: &str = "id, server_id, stack_pattern, registry_url, image_pattern, username, encrypted_password, created_at, updated_at";

fn registry_from_row(row: &Row<'_>) -> rusqlite::Result<RegistryCredential> {
    Ok(RegistryCredential {
        id: row.get(0)?,
        server_id: row.get(1)?,
        stack_pattern: row.get(2)?,
        registry_url: row.get(3)?,
        image_pattern: row.get(4)?,
        username: row.get(5)?,
        encrypted_password: row.get(6)?,
        created_at: parse_datetime(&row.get::<_, String>(7)?),
        updated_at: parse_datetime(&row.get::<_, String>(8)?),
    })
}

const IMAGE_UPDATE_COLUMNS: &str = "id, server_id, stack_name, container_name, current_image_name, current_repo_digest, latest_repo_digest, update_available, last_checked_at, check_error";

fn image_update_from_row(row: &Row<'_>) -> rusqlite::Result<ContainerImageUpdate> {
    Ok(ContainerImageUpdate {
        id: row.get(0)?,
        server_id: row.get(1)?,
        stack_name: row.get(2)?,
        container_name: row.get(3)?,
        current_image_name: row.get(4)?,
        current_repo_digest: row.get(5)?,
        latest_repo_digest: row.get(6)?,
        update_available: row.get(7)?,
        last_checked_at: parse_datetime(&row.get::<_, String>(8)?),
        check_error: row.get(9)?,
    })
}

const REFRESH_COLUMNS: &str =
    "id, user_id, token_hash, family_id, expires_at, revoked_at, session_info, created_at";

fn refresh_from_row(row: &Row<'_>) -> rusqlite::Result<RefreshToken> {
    Ok(RefreshToken {
        id: row.get(0)?,
        user_id: row.get(1)?,
        token_hash: row.get(2)?,
        family_id: row.get(3)?,
        expires_at: parse_datetime(&row.get::<_, String>(4)?),
        revoked_at: parse_optional_datetime(row.get(5)?),
        session_info: row.get(6)?,
        created_at: parse_datetime(&row.get::<_, String>(7)?),
    })
}

const SESSION_COLUMNS: &str = "id, user_id, token, type, ip, user_agent, created_at, last_used, expires_at, jwt_access_jti, refresh_token_id";

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<UserSession> {
    Ok(UserSession {
        id: row.get(0)?,
        user_id: row.get(1)?,
        token: row.get(2)?,
        session_type: SessionType::parse(&row.get::<_, String>(3)?).unwrap_or(SessionType::Jwt),
        ip: row.get(4)?,
        user_agent: row.get(5)?,
        created_at: parse_datetime(&row.get::<_, String>(6)?),
        last_used: parse_datetime(&row.get::<_, String>(7)?),
        expires_at: parse_datetime(&row.get::<_, String>(8)?),
        jwt_access_jti: row.get(9)?,
        refresh_token_id: row.get(10)?,
    })
}

const OPERATION_LOG_COLUMNS: &str = "id, user_id, server_id, stack_name, operation_id, command, options, services, start_time, end_time, success, exit_code, failure_reason";

fn operation_log_from_row(row: &Row<'_>) -> rusqlite::Result<OperationLog> {
    Ok(OperationLog {
        id: row.get(0)?,
        user_id: row.get(1)?,
        server_id: row.get(2)?,
        stack_name: row.get(3)?,
        operation_id: row.get(4)?,
        command: row.get(5)?,
        options: serde_json::from_str(&row.get::<_, String>(6)?).unwrap_or_default(),
        services: serde_json::from_str(&row.get::<_, String>(7)?).unwrap_or_default(),
        start_time: parse_datetime(&row.get::<_, String>(8)?),
        end_time: parse_optional_datetime(row.get(9)?),
        success: row.get(10)?,
        exit_code: row.get(11)?,
        failure_reason: row.get(12)?,
    })
}

const MESSAGE_COLUMNS: &str =
    "id, operation_log_id, sequence, timestamp, kind, data, exit_code, success";

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<OperationLogMessage> {
    Ok(OperationLogMessage {
        id: row.get(0)?,
        operation_log_id: row.get(1)?,
        sequence: row.get(2)?,
        timestamp: parse_datetime(&row.get::<_, String>(3)?),
        kind: MessageKind::parse(&row.get::<_, String>(4)?).unwrap_or(MessageKind::Stdout),
        data: row.get(5)?,
        exit_code: row.get(6)?,
        success: row.get(7)?,
    })
}

const AUDIT_COLUMNS: &str = "id, created_at, event_type, event_category, severity, actor_user_id, actor_username, actor_ip, actor_user_agent, target_type, target_id, target_name, success, failure_reason, metadata, server_id, stack_name, session_id";

fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<SecurityAuditLog> {
    Ok(SecurityAuditLog {
        id: row.get(0)?,
        created_at: parse_datetime(&row.get::<_, String>(1)?),
        event_type: row.get(2)?,
        event_category: row.get(3)?,
        severity: row.get(4)?,
        actor_user_id: row.get(5)?,
        actor_username: row.get(6)?,
        actor_ip: row.get(7)?,
        actor_user_agent: row.get(8)?,
        target_type: row.get(9)?,
        target_id: row.get(10)?,
        target_name: row.get(11)?,
        success: row.get(12)?,
        failure_reason: row.get(13)?,
        metadata: serde_json::from_str(&row.get::<_, String>(14)?)
            .unwrap_or(serde_json::Value::Null),
        server_id: row.get(15)?,
        stack_name: row.get(16)?,
        session_id: row.get(17)?,
    })
}

fn collect<T>(rows: impl Iterator<Item = rusqlite::Result<T>>) -> Result<Vec<T>> {
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Error::from)
}

impl Store for SqliteStore {
    fn initialize(&self) -> Result<()> {
        let mut conn = self.conn();
        conn.execute_batch(SCHEMA)?;

        let tx = conn.transaction()?;
        for p in Permission::ALL {
            tx.execute(
                "INSERT INTO permissions (name, resource, action, description, is_api_key_only)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(name) DO UPDATE SET description = excluded.description",
                params![
                    p.name(),
                    p.resource(),
                    p.action(),
                    p.description(),
                    p.is_api_key_only()
                ],
            )?;
        }
        tx.execute(
            "INSERT OR IGNORE INTO roles (name, description, is_admin, created_at)
             VALUES (?1, 'Full access to every server, stack and admin function', 1, ?2)",
            params![ADMIN_ROLE_NAME, format_datetime(&Utc::now())],
        )?;
        tx.commit()?;
        Ok(())
    }

    // User operations

    fn create_user(&self, username: &str, email: &str, password_hash: &str) -> Result<User> {
        let now = Utc::now();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO users (username, email, password_hash, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![username, email, password_hash, format_datetime(&now)],
        )
        .map_err(unique)?;

        Ok(User {
            id: conn.last_insert_rowid(),
            username: username.to_string(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            email_verified_at: None,
            last_login_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    fn get_user(&self, id: i64) -> Result<Option<User>> {
        self.conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id],
                user_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        self.conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?1"),
                params![username],
                user_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn list_users(&self) -> Result<Vec<User>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY id"))?;
        let rows = stmt.query_map([], user_from_row)?;
        collect(rows)
    }

    fn count_users(&self) -> Result<i64> {
        let count = self
            .conn()
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(count)
    }

    fn update_user_password(&self, id: i64, password_hash: &str) -> Result<()> {
        let rows = self.conn().execute(
            "UPDATE users SET password_hash = ?1, updated_at = ?2 WHERE id = ?3",
            params![password_hash, format_datetime(&Utc::now()), id],
        )?;

        if rows == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    fn update_user_email(
        &self,
        id: i64,
        email: &str,
        verified_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let rows = self.conn().execute(
            "UPDATE users SET email = ?1, email_verified_at = ?2, updated_at = ?3 WHERE id = ?4",
            params![
                email,
                verified_at.as_ref().map(format_datetime),
                format_datetime(&Utc::now()),
                id
            ],
        )?;

        if rows == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    fn update_user_last_login(&self, id: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE users SET last_login_at = ?1 WHERE id = ?2",
            params![format_datetime(&Utc::now()), id],
        )?;
        Ok(())
    }

    fn delete_user(&self, id: i64) -> Result<bool> {
        let rows = self
            .conn()
            .execute("DELETE FROM users WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    // Role operations

    fn create_role(&self, name: &str, description: &str, is_admin: bool) -> Result<Role> {
        let now = Utc::now();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO roles (name, description, is_admin, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![name, description, is_admin, format_datetime(&now)],
        )
        .map_err(unique)?;

        Ok(Role {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            description: description.to_string(),
            is_admin,
            created_at: now,
        })
    }

    fn get_role(&self, id: i64) -> Result<Option<Role>> {
        self.conn()
            .query_row(
                &format!("SELECT {ROLE_COLUMNS} FROM roles WHERE id = ?1"),
                params![id],
                role_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn get_role_by_name(&self, name: &str) -> Result<Option<Role>> {
        self.conn()
            .query_row(
                &format!("SELECT {ROLE_COLUMNS} FROM roles WHERE name = ?1"),
                params![name],
                role_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn list_roles(&self) -> Result<Vec<Role>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT {ROLE_COLUMNS} FROM roles ORDER BY id"))?;
        let rows = stmt.query_map([], role_from_row)?;
        collect(rows)
    }

    fn update_role(&self, id: i64, name: &str, description: &str) -> Result<()> {
        let rows = self
            .conn()
            .execute(
                "UPDATE roles SET name = ?1, description = ?2 WHERE id = ?3",
                params![name, description, id],
            )
            .map_err(unique)?;

        if rows == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    fn delete_role(&self, id: i64) -> Result<bool> {
        let rows = self
            .conn()
            .execute("DELETE FROM roles WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    // User-Role M2M operations

    fn assign_role(&self, user_id: i64, role_id: i64) -> Result<bool> {
        let rows = self.conn().execute(
            "INSERT OR IGNORE INTO user_roles (user_id, role_id) VALUES (?1, ?2)",
            params![user_id, role_id],
        )?;
        Ok(rows > 0)
    }

    fn revoke_role(&self, user_id: i64, role_id: i64) -> Result<bool> {
        let rows = self.conn().execute(
            "DELETE FROM user_roles WHERE user_id = ?1 AND role_id = ?2",
            params![user_id, role_id],
        )?;
        Ok(rows > 0)
    }

    fn list_user_roles(&self, user_id: i64) -> Result<Vec<Role>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT r.id, r.name, r.description, r.is_admin, r.created_at
             FROM roles r
             JOIN user_roles ur ON ur.role_id = r.id
             WHERE ur.user_id = ?1
             ORDER BY r.name",
        )?;
        let rows = stmt.query_map(params![user_id], role_from_row)?;
        collect(rows)
    }

    fn user_is_admin(&self, user_id: i64) -> Result<bool> {
        let exists: bool = self.conn().query_row(
            "SELECT EXISTS(
                SELECT 1 FROM user_roles ur JOIN roles r ON r.id = ur.role_id
                WHERE ur.user_id = ?1 AND r.is_admin = 1)",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    // Permission vocabulary and grants

    fn list_permissions(&self) -> Result<Vec<PermissionRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PERMISSION_COLUMNS} FROM permissions ORDER BY name"
        ))?;
        let rows = stmt.query_map([], permission_from_row)?;
        collect(rows)
    }

    fn get_permission_by_name(&self, name: &str) -> Result<Option<PermissionRecord>> {
        self.conn()
            .query_row(
                &format!("SELECT {PERMISSION_COLUMNS} FROM permissions WHERE name = ?1"),
                params![name],
                permission_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn add_role_permission(&self, role_id: i64, permission_id: i64) -> Result<bool> {
        let rows = self.conn().execute(
            "INSERT OR IGNORE INTO role_permissions (role_id, permission_id) VALUES (?1, ?2)",
            params![role_id, permission_id],
        )?;
        Ok(rows > 0)
    }

    fn remove_role_permission(&self, role_id: i64, permission_id: i64) -> Result<bool> {
        let rows = self.conn().execute(
            "DELETE FROM role_permissions WHERE role_id = ?1 AND permission_id = ?2",
            params![role_id, permission_id],
        )?;
        Ok(rows > 0)
    }

    fn list_role_permissions(&self, role_id: i64) -> Result<Vec<PermissionRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT p.id, p.name, p.resource, p.action, p.description, p.is_api_key_only
             FROM permissions p
             JOIN role_permissions rp ON rp.permission_id = p.id
             WHERE rp.role_id = ?1
             ORDER BY p.name",
        )?;
        let rows = stmt.query_map(params![role_id], permission_from_row)?;
        collect(rows)
    }

    fn user_has_role_permission(&self, user_id: i64, permission: &str) -> Result<bool> {
        let exists: bool = self.conn().query_row(
            "SELECT EXISTS(
                SELECT 1 FROM user_roles ur
                JOIN role_permissions rp ON rp.role_id = ur.role_id
                JOIN permissions p ON p.id = rp.permission_id
                WHERE ur.user_id = ?1 AND p.name = ?2)",
            params![user_id, permission],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn add_stack_permission(
        &self,
        server_id: i64,
        role_id: i64,
        permission_id: i64,
        stack_pattern: &str,
    ) -> Result<StackPermission> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO server_role_stack_permissions (server_id, role_id, permission_id, stack_pattern, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                server_id,
                role_id,
                permission_id,
                stack_pattern,
                format_datetime(&Utc::now())
            ],
        )
        .map_err(unique)?;

        let id = conn.last_insert_rowid();
        conn.query_row(
            &format!("{STACK_PERMISSION_SELECT} WHERE s.id = ?1"),
            params![id],
            stack_permission_from_row,
        )
        .map_err(Error::from)
    }

    fn delete_stack_permission(&self, role_id: i64, id: i64) -> Result<bool> {
        let rows = self.conn().execute(
            "DELETE FROM server_role_stack_permissions WHERE id = ?1 AND role_id = ?2",
            params![id, role_id],
        )?;
        Ok(rows > 0)
    }

    fn list_role_stack_permissions(&self, role_id: i64) -> Result<Vec<StackPermission>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "{STACK_PERMISSION_SELECT} WHERE s.role_id = ?1 ORDER BY s.server_id, s.stack_pattern, p.name"
        ))?;
        let rows = stmt.query_map(params![role_id], stack_permission_from_row)?;
        collect(rows)
    }

    fn list_user_stack_permissions(
        &self,
        user_id: i64,
        server_id: Option<i64>,
    ) -> Result<Vec<StackPermission>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "{STACK_PERMISSION_SELECT}
             JOIN user_roles ur ON ur.role_id = s.role_id
             WHERE ur.user_id = ?1 AND (?2 IS NULL OR s.server_id = ?2)
             ORDER BY s.server_id, s.id"
        ))?;
        let rows = stmt.query_map(params![user_id, server_id], stack_permission_from_row)?;
        collect(rows)
    }

    // Server operations

    fn create_server(&self, server: &NewServer) -> Result<Server> {
        let now = Utc::now();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO servers (name, description, host, port, skip_ssl_verification, access_token, is_active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                server.name,
                server.description,
                server.host,
                server.port,
                server.skip_ssl_verification,
                server.access_token,
                server.is_active,
                format_datetime(&now),
            ],
        )
        .map_err(unique)?;

        Ok(Server {
            id: conn.last_insert_rowid(),
            name: server.name.clone(),
            description: server.description.clone(),
            host: server.host.clone(),
            port: server.port,
            skip_ssl_verification: server.skip_ssl_verification,
            access_token: server.access_token.clone(),
            is_active: server.is_active,
            created_at: now,
            updated_at: now,
        })
    }

    fn get_server(&self, id: i64) -> Result<Option<Server>> {
        self.conn()
            .query_row(
                &format!("SELECT {SERVER_COLUMNS} FROM servers WHERE id = ?1"),
                params![id],
                server_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn list_servers(&self) -> Result<Vec<Server>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("SELECT {SERVER_COLUMNS} FROM servers ORDER BY name"))?;
        let rows = stmt.query_map([], server_from_row)?;
        collect(rows)
    }

    fn list_active_servers(&self) -> Result<Vec<Server>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SERVER_COLUMNS} FROM servers WHERE is_active = 1 ORDER BY id"
        ))?;
        let rows = stmt.query_map([], server_from_row)?;
        collect(rows)
    }

    fn update_server(&self, server: &Server) -> Result<()> {
        let rows = self
            .conn()
            .execute(
                "UPDATE servers SET name = ?1, description = ?2, host = ?3, port = ?4,
                 skip_ssl_verification = ?5, is_active = ?6, updated_at = ?7 WHERE id = ?8",
                params![
                    server.name,
                    server.description,
                    server.host,
                    server.port,
                    server.skip_ssl_verification,
                    server.is_active,
                    format_datetime(&Utc::now()),
                    server.id
                ],
            )
            .map_err(unique)?;

        if rows == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    fn update_server_access_token(&self, id: i64, access_token: &str) -> Result<()> {
        let rows = self.conn().execute(
            "UPDATE servers SET access_token = ?1, updated_at = ?2 WHERE id = ?3",
            params![access_token, format_datetime(&Utc::now()), id],
        )?;

        if rows == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    fn delete_server(&self, id: i64) -> Result<bool> {
        let rows = self
            .conn()
            .execute("DELETE FROM servers WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    // API key operations

    fn create_api_key(
        &self,
        user_id: i64,
        name: &str,
        prefix: &str,
        key_hash: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<ApiKey> {
        let now = Utc::now();
        let conn = self.conn();
        let result = conn.execute(
            "INSERT INTO api_keys (user_id, key_hash, prefix, name, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                user_id,
                key_hash,
                prefix,
                name,
                expires_at.as_ref().map(format_datetime),
                format_datetime(&now),
            ],
        );

        match result {
            Ok(_) => Ok(ApiKey {
                id: conn.last_insert_rowid(),
                user_id,
                key_hash: key_hash.to_string(),
                prefix: prefix.to_string(),
                name: name.to_string(),
                last_used_at: None,
                expires_at,
                created_at: now,
            }),
            Err(e) if is_constraint_violation(&e) => Err(Error::TokenLookupCollision),
            Err(e) => Err(Error::from(e)),
        }
    }

    fn get_api_key(&self, id: i64) -> Result<Option<ApiKey>> {
        self.conn()
            .query_row(
                &format!("SELECT {API_KEY_COLUMNS} FROM api_keys WHERE id = ?1"),
                params![id],
                api_key_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn get_api_key_by_prefix(&self, prefix: &str) -> Result<Option<ApiKey>> {
        self.conn()
            .query_row(
                &format!("SELECT {API_KEY_COLUMNS} FROM api_keys WHERE prefix = ?1"),
                params![prefix],
                api_key_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn list_user_api_keys(&self, user_id: i64) -> Result<Vec<ApiKey>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {API_KEY_COLUMNS} FROM api_keys WHERE user_id = ?1 ORDER BY created_at DESC"
        ))?;
        let rows = stmt.query_map(params![user_id], api_key_from_row)?;
        collect(rows)
    }

    fn delete_api_key(&self, id: i64) -> Result<bool> {
        let rows = self
            .conn()
            .execute("DELETE FROM api_keys WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    fn update_api_key_last_used(&self, id: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE api_keys SET last_used_at = ?1 WHERE id = ?2",
            params![format_datetime(&Utc::now()), id],
        )?;
        Ok(())
    }

    fn add_api_key_scope(
        &self,
        api_key_id: i64,
        permission_id: i64,
        server_id: Option<i64>,
        stack_pattern: &str,
    ) -> Result<ApiKeyScope> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO api_key_scopes (api_key_id, permission_id, server_id, stack_pattern)
             VALUES (?1, ?2, ?3, ?4)",
            params![api_key_id, permission_id, server_id, stack_pattern],
        )?;

        let id = conn.last_insert_rowid();
        conn.query_row(
            &format!("{API_KEY_SCOPE_SELECT} WHERE s.id = ?1"),
            params![id],
            api_key_scope_from_row,
        )
        .map_err(Error::from)
    }

    fn list_api_key_scopes(&self, api_key_id: i64) -> Result<Vec<ApiKeyScope>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "{API_KEY_SCOPE_SELECT} WHERE s.api_key_id = ?1 ORDER BY s.id"
        ))?;
        let rows = stmt.query_map(params![api_key_id], api_key_scope_from_row)?;
        collect(rows)
    }

    fn delete_api_key_scope(&self, api_key_id: i64, scope_id: i64) -> Result<bool> {
        let rows = self.conn().execute(
            "DELETE FROM api_key_scopes WHERE id = ?1 AND api_key_id = ?2",
            params![scope_id, api_key_id],
        )?;
        Ok(rows > 0)
    }

    // Registry credential operations

    fn create_registry_credential(
        &self,
        credential: &NewRegistryCredential,
    ) -> Result<RegistryCredential> {
        let now = Utc::now();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO server_registry_credentials
             (server_id, stack_pattern, registry_url, image_pattern, username, encrypted_password, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                credential.server_id,
                credential.stack_pattern,
                credential.registry_url,
                credential.image_pattern,
                credential.username,
                credential.encrypted_password,
                format_datetime(&now),
            ],
        )?;

        Ok(RegistryCredential {
            id: conn.last_insert_rowid(),
            server_id: credential.server_id,
            stack_pattern: credential.stack_pattern.clone(),
            registry_url: credential.registry_url.clone(),
            image_pattern: credential.image_pattern.clone(),
            username: credential.username.clone(),
            encrypted_password: credential.encrypted_password.clone(),
            created_at: now,
            updated_at: now,
        })
    }

    fn get_registry_credential(
        &self,
        server_id: i64,
        id: i64,
    ) -> Result<Option<RegistryCredential>> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {REGISTRY_COLUMNS} FROM server_registry_credentials
                     WHERE id = ?1 AND server_id = ?2"
                ),
                params![id, server_id],
                registry_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn list_registry_credentials(&self, server_id: i64) -> Result<Vec<RegistryCredential>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {REGISTRY_COLUMNS} FROM server_registry_credentials
             WHERE server_id = ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![server_id], registry_from_row)?;
        collect(rows)
    }

    fn update_registry_credential(&self, credential: &RegistryCredential) -> Result<()> {
        let rows = self.conn().execute(
            "UPDATE server_registry_credentials
             SET stack_pattern = ?1, registry_url = ?2, image_pattern = ?3, username = ?4,
                 encrypted_password = ?5, updated_at = ?6
             WHERE id = ?7 AND server_id = ?8",
            params![
                credential.stack_pattern,
                credential.registry_url,
                credential.image_pattern,
                credential.username,
                credential.encrypted_password,
                format_datetime(&Utc::now()),
                credential.id,
                credential.server_id,
            ],
        )?;

        if rows == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    fn delete_registry_credential(&self, server_id: i64, id: i64) -> Result<bool> {
        let rows = self.conn().execute(
            "DELETE FROM server_registry_credentials WHERE id = ?1 AND server_id = ?2",
            params![id, server_id],
        )?;
        Ok(rows > 0)
    }

    // Image update operations

    fn replace_image_updates(
        &self,
        server_id: i64,
        records: &[NewImageUpdate],
        checked_at: DateTime<Utc>,
    ) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let checked_at = format_datetime(&checked_at);

        for record in records {
            tx.execute(
                "INSERT INTO container_image_updates
                 (server_id, stack_name, container_name, current_image_name, current_repo_digest,
                  latest_repo_digest, update_available, last_checked_at, check_error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(server_id, stack_name, container_name) DO UPDATE SET
                    current_image_name = excluded.current_image_name,
                    current_repo_digest = excluded.current_repo_digest,
                    latest_repo_digest = excluded.latest_repo_digest,
                    update_available = excluded.update_available,
                    last_checked_at = excluded.last_checked_at,
                    check_error = excluded.check_error",
                params![
                    server_id,
                    record.stack_name,
                    record.container_name,
                    record.current_image_name,
                    record.current_repo_digest,
                    record.latest_repo_digest,
                    record.update_available,
                    checked_at,
                    record.check_error,
                ],
            )?;
        }

        let keep: HashSet<(&str, &str)> = records
            .iter()
            .map(|r| (r.stack_name.as_str(), r.container_name.as_str()))
            .collect();

        let existing: Vec<(i64, String, String)> = {
            let mut stmt = tx.prepare(
                "SELECT id, stack_name, container_name FROM container_image_updates WHERE server_id = ?1",
            )?;
            let rows = stmt.query_map(params![server_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut removed = 0;
        for (id, stack, container) in existing {
            if !keep.contains(&(stack.as_str(), container.as_str())) {
                removed += tx.execute(
                    "DELETE FROM container_image_updates WHERE id = ?1",
                    params![id],
                )?;
            }
        }

        tx.commit()?;
        Ok(removed)
    }

    fn list_image_updates(&self, server_id: i64) -> Result<Vec<ContainerImageUpdate>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {IMAGE_UPDATE_COLUMNS} FROM container_image_updates
             WHERE server_id = ?1 ORDER BY stack_name, container_name"
        ))?;
        let rows = stmt.query_map(params![server_id], image_update_from_row)?;
        collect(rows)
    }

    fn list_all_image_updates(&self) -> Result<Vec<ContainerImageUpdate>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {IMAGE_UPDATE_COLUMNS} FROM container_image_updates
             ORDER BY server_id, stack_name, container_name"
        ))?;
        let rows = stmt.query_map([], image_update_from_row)?;
        collect(rows)
    }

    // Refresh token operations

    fn create_refresh_token(&self, token: &NewRefreshToken) -> Result<RefreshToken> {
        let now = Utc::now();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO refresh_tokens (user_id, token_hash, family_id, expires_at, session_info, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                token.user_id,
                token.token_hash,
                token.family_id,
                format_datetime(&token.expires_at),
                token.session_info,
                format_datetime(&now),
            ],
        )
        .map_err(unique)?;

        Ok(RefreshToken {
            id: conn.last_insert_rowid(),
            user_id: token.user_id,
            token_hash: token.token_hash.clone(),
            family_id: token.family_id.clone(),
            expires_at: token.expires_at,
            revoked_at: None,
            session_info: token.session_info.clone(),
            created_at: now,
        })
    }

    fn get_refresh_token_by_hash(&self, token_hash: &str) -> Result<Option<RefreshToken>> {
        self.conn()
            .query_row(
                &format!("SELECT {REFRESH_COLUMNS} FROM refresh_tokens WHERE token_hash = ?1"),
                params![token_hash],
                refresh_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn rotate_refresh_token(
        &self,
        old_id: i64,
        new_token: &NewRefreshToken,
        session: &SessionRotation,
    ) -> Result<Option<RefreshToken>> {
        let now = Utc::now();
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let revoked = tx.execute(
            "UPDATE refresh_tokens SET revoked_at = ?1 WHERE id = ?2 AND revoked_at IS NULL",
            params![format_datetime(&now), old_id],
        )?;
        if revoked == 0 {
            return Ok(None);
        }

        tx.execute(
            "INSERT INTO refresh_tokens (user_id, token_hash, family_id, expires_at, session_info, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                new_token.user_id,
                new_token.token_hash,
                new_token.family_id,
                format_datetime(&new_token.expires_at),
                new_token.session_info,
                format_datetime(&now),
            ],
        )?;
        let new_id = tx.last_insert_rowid();

        tx.execute(
            "UPDATE user_sessions
             SET refresh_token_id = ?1, token = ?2, jwt_access_jti = ?3, expires_at = ?4, last_used = ?5
             WHERE refresh_token_id = ?6",
            params![
                new_id,
                UserSession::token_for_refresh_id(new_id),
                session.jwt_access_jti,
                format_datetime(&session.expires_at),
                format_datetime(&now),
                old_id,
            ],
        )?;

        tx.commit()?;

        Ok(Some(RefreshToken {
            id: new_id,
            user_id: new_token.user_id,
            token_hash: new_token.token_hash.clone(),
            family_id: new_token.family_id.clone(),
            expires_at: new_token.expires_at,
            revoked_at: None,
            session_info: new_token.session_info.clone(),
            created_at: now,
        }))
    }

    fn revoke_refresh_token(&self, id: i64) -> Result<bool> {
        let rows = self.conn().execute(
            "UPDATE refresh_tokens SET revoked_at = ?1 WHERE id = ?2 AND revoked_at IS NULL",
            params![format_datetime(&Utc::now()), id],
        )?;
        Ok(rows > 0)
    }

    fn revoke_refresh_family(&self, family_id: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        tx.execute(
            "UPDATE refresh_tokens SET revoked_at = ?1 WHERE family_id = ?2 AND revoked_at IS NULL",
            params![format_datetime(&Utc::now()), family_id],
        )?;

        let jtis: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT jwt_access_jti FROM user_sessions
                 WHERE jwt_access_jti IS NOT NULL
                   AND refresh_token_id IN (SELECT id FROM refresh_tokens WHERE family_id = ?1)",
            )?;
            let rows = stmt.query_map(params![family_id], |row| row.get(0))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        tx.execute(
            "DELETE FROM user_sessions
             WHERE refresh_token_id IN (SELECT id FROM refresh_tokens WHERE family_id = ?1)",
            params![family_id],
        )?;

        tx.commit()?;
        Ok(jtis)
    }

    fn delete_expired_refresh_tokens(&self, now: DateTime<Utc>) -> Result<usize> {
        let rows = self.conn().execute(
            "DELETE FROM refresh_tokens WHERE expires_at < ?1",
            params![format_datetime(&now)],
        )?;
        Ok(rows)
    }

    // Access token revocation

    fn insert_revoked_token(&self, jti: &str, expires_at: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO revoked_tokens (jti, expires_at) VALUES (?1, ?2)",
            params![jti, format_datetime(&expires_at)],
        )?;
        Ok(())
    }

    fn list_revoked_tokens(&self) -> Result<Vec<(String, DateTime<Utc>)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT jti, expires_at FROM revoked_tokens")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get(0)?, parse_datetime(&row.get::<_, String>(1)?)))
        })?;
        collect(rows)
    }

    fn delete_expired_revoked_tokens(&self, now: DateTime<Utc>) -> Result<usize> {
        let rows = self.conn().execute(
            "DELETE FROM revoked_tokens WHERE expires_at < ?1",
            params![format_datetime(&now)],
        )?;
        Ok(rows)
    }

    // Session operations

    fn create_session(&self, session: &NewSession) -> Result<UserSession> {
        let now = Utc::now();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO user_sessions
             (user_id, token, type, ip, user_agent, created_at, last_used, expires_at, jwt_access_jti, refresh_token_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7, ?8, ?9)",
            params![
                session.user_id,
                session.token,
                session.session_type.as_str(),
                session.ip,
                session.user_agent,
                format_datetime(&now),
                format_datetime(&session.expires_at),
                session.jwt_access_jti,
                session.refresh_token_id,
            ],
        )
        .map_err(unique)?;

        Ok(UserSession {
            id: conn.last_insert_rowid(),
            user_id: session.user_id,
            token: session.token.clone(),
            session_type: session.session_type,
            ip: session.ip.clone(),
            user_agent: session.user_agent.clone(),
            created_at: now,
            last_used: now,
            expires_at: session.expires_at,
            jwt_access_jti: session.jwt_access_jti.clone(),
            refresh_token_id: session.refresh_token_id,
        })
    }

    fn get_session(&self, id: i64) -> Result<Option<UserSession>> {
        self.conn()
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM user_sessions WHERE id = ?1"),
                params![id],
                session_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn get_session_by_token(&self, token: &str) -> Result<Option<UserSession>> {
        self.conn()
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM user_sessions WHERE token = ?1"),
                params![token],
                session_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn get_session_by_jti(&self, jti: &str) -> Result<Option<UserSession>> {
        self.conn()
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM user_sessions WHERE jwt_access_jti = ?1"),
                params![jti],
                session_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn get_session_by_refresh_id(&self, refresh_token_id: i64) -> Result<Option<UserSession>> {
        self.conn()
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM user_sessions WHERE refresh_token_id = ?1"),
                params![refresh_token_id],
                session_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn list_user_sessions(&self, user_id: i64) -> Result<Vec<UserSession>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM user_sessions WHERE user_id = ?1 ORDER BY last_used DESC"
        ))?;
        let rows = stmt.query_map(params![user_id], session_from_row)?;
        collect(rows)
    }

    fn touch_session(&self, id: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE user_sessions SET last_used = ?1 WHERE id = ?2",
            params![format_datetime(&Utc::now()), id],
        )?;
        Ok(())
    }

    fn delete_session(&self, id: i64) -> Result<bool> {
        let rows = self
            .conn()
            .execute("DELETE FROM user_sessions WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    fn delete_user_sessions(&self, user_id: i64, keep_id: Option<i64>) -> Result<Vec<UserSession>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let sessions = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM user_sessions
                 WHERE user_id = ?1 AND (?2 IS NULL OR id != ?2)"
            ))?;
            let rows = stmt.query_map(params![user_id, keep_id], session_from_row)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        tx.execute(
            "DELETE FROM user_sessions WHERE user_id = ?1 AND (?2 IS NULL OR id != ?2)",
            params![user_id, keep_id],
        )?;
        tx.commit()?;
        Ok(sessions)
    }

    fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize> {
        let rows = self.conn().execute(
            "DELETE FROM user_sessions WHERE expires_at < ?1",
            params![format_datetime(&now)],
        )?;
        Ok(rows)
    }

    // TOTP operations

    fn get_totp(&self, user_id: i64) -> Result<Option<TotpSecret>> {
        self.conn()
            .query_row(
                "SELECT user_id, encrypted_secret, enabled, created_at, enabled_at
                 FROM user_totp WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok(TotpSecret {
                        user_id: row.get(0)?,
                        encrypted_secret: row.get(1)?,
                        enabled: row.get(2)?,
                        created_at: parse_datetime(&row.get::<_, String>(3)?),
                        enabled_at: parse_optional_datetime(row.get(4)?),
                    })
                },
            )
            .optional()
            .map_err(Error::from)
    }

    fn upsert_pending_totp(&self, user_id: i64, encrypted_secret: &str) -> Result<()> {
        let rows = self.conn().execute(
            "INSERT INTO user_totp (user_id, encrypted_secret, enabled, created_at)
             VALUES (?1, ?2, 0, ?3)
             ON CONFLICT(user_id) DO UPDATE SET
                encrypted_secret = excluded.encrypted_secret,
                created_at = excluded.created_at
             WHERE user_totp.enabled = 0",
            params![user_id, encrypted_secret, format_datetime(&Utc::now())],
        )?;

        if rows == 0 {
            return Err(Error::Conflict("two-factor authentication is already enabled".into()));
        }
        Ok(())
    }

    fn enable_totp(&self, user_id: i64) -> Result<bool> {
        let rows = self.conn().execute(
            "UPDATE user_totp SET enabled = 1, enabled_at = ?1 WHERE user_id = ?2 AND enabled = 0",
            params![format_datetime(&Utc::now()), user_id],
        )?;
        Ok(rows > 0)
    }

    fn delete_totp(&self, user_id: i64) -> Result<bool> {
        let rows = self
            .conn()
            .execute("DELETE FROM user_totp WHERE user_id = ?1", params![user_id])?;
        Ok(rows > 0)
    }

    fn record_totp_window(&self, user_id: i64, window: i64) -> Result<bool> {
        let rows = self.conn().execute(
            "INSERT OR IGNORE INTO totp_used_codes (user_id, code_window, used_at) VALUES (?1, ?2, ?3)",
            params![user_id, window, format_datetime(&Utc::now())],
        )?;
        Ok(rows > 0)
    }

    fn delete_totp_windows_before(&self, window: i64) -> Result<usize> {
        let rows = self.conn().execute(
            "DELETE FROM totp_used_codes WHERE code_window < ?1",
            params![window],
        )?;
        Ok(rows)
    }

    // Operation log operations

    fn create_operation_log(&self, log: &NewOperationLog) -> Result<OperationLog> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO operation_logs (user_id, server_id, stack_name, operation_id, command, options, services, start_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                log.user_id,
                log.server_id,
                log.stack_name,
                log.operation_id,
                log.command,
                serde_json::to_string(&log.options)?,
                serde_json::to_string(&log.services)?,
                format_datetime(&log.start_time),
            ],
        )
        .map_err(unique)?;

        Ok(OperationLog {
            id: conn.last_insert_rowid(),
            user_id: log.user_id,
            server_id: log.server_id,
            stack_name: log.stack_name.clone(),
            operation_id: log.operation_id.clone(),
            command: log.command.clone(),
            options: log.options.clone(),
            services: log.services.clone(),
            start_time: log.start_time,
            end_time: None,
            success: None,
            exit_code: None,
            failure_reason: None,
        })
    }

    fn get_operation_log(&self, id: i64) -> Result<Option<OperationLog>> {
        self.conn()
            .query_row(
                &format!("SELECT {OPERATION_LOG_COLUMNS} FROM operation_logs WHERE id = ?1"),
                params![id],
                operation_log_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn get_operation_log_by_operation_id(
        &self,
        operation_id: &str,
    ) -> Result<Option<OperationLog>> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {OPERATION_LOG_COLUMNS} FROM operation_logs WHERE operation_id = ?1"
                ),
                params![operation_id],
                operation_log_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn list_operation_logs(&self, filter: &OperationLogFilter) -> Result<Vec<OperationLog>> {
        let mut sql = format!("SELECT {OPERATION_LOG_COLUMNS} FROM operation_logs WHERE 1 = 1");
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(user_id) = filter.user_id {
            args.push(Box::new(user_id));
            sql.push_str(&format!(" AND user_id = ?{}", args.len()));
        }
        if let Some(server_id) = filter.server_id {
            args.push(Box::new(server_id));
            sql.push_str(&format!(" AND server_id = ?{}", args.len()));
        }
        if let Some(stack) = &filter.stack_name {
            args.push(Box::new(stack.clone()));
            sql.push_str(&format!(" AND stack_name = ?{}", args.len()));
        }
        args.push(Box::new(filter.limit));
        sql.push_str(&format!(" ORDER BY start_time DESC, id DESC LIMIT ?{}", args.len()));
        args.push(Box::new(filter.offset));
        sql.push_str(&format!(" OFFSET ?{}", args.len()));

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), operation_log_from_row)?;
        collect(rows)
    }

    fn append_operation_message(
        &self,
        operation_log_id: i64,
        message: &NewOperationMessage,
    ) -> Result<OperationLogMessage> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO operation_log_messages (operation_log_id, sequence, timestamp, kind, data, exit_code, success)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                operation_log_id,
                message.sequence,
                format_datetime(&message.timestamp),
                message.kind.as_str(),
                message.data,
                message.exit_code,
                message.success,
            ],
        )?;

        Ok(OperationLogMessage {
            id: conn.last_insert_rowid(),
            operation_log_id,
            sequence: message.sequence,
            timestamp: message.timestamp,
            kind: message.kind,
            data: message.data.clone(),
            exit_code: message.exit_code,
            success: message.success,
        })
    }

    fn list_operation_messages(&self, operation_log_id: i64) -> Result<Vec<OperationLogMessage>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM operation_log_messages
             WHERE operation_log_id = ?1 ORDER BY sequence"
        ))?;
        let rows = stmt.query_map(params![operation_log_id], message_from_row)?;
        collect(rows)
    }

    fn finish_operation_log(&self, id: i64, outcome: &OperationOutcome) -> Result<()> {
        let rows = self.conn().execute(
            "UPDATE operation_logs SET end_time = ?1, success = ?2, exit_code = ?3, failure_reason = ?4
             WHERE id = ?5 AND end_time IS NULL",
            params![
                format_datetime(&outcome.end_time),
                outcome.success,
                outcome.exit_code,
                outcome.failure_reason,
                id
            ],
        )?;

        if rows == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    fn delete_operation_logs_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let rows = self.conn().execute(
            "DELETE FROM operation_logs WHERE end_time IS NOT NULL AND start_time < ?1",
            params![format_datetime(&cutoff)],
        )?;
        Ok(rows)
    }

    // Security audit log operations

    fn insert_security_audit_log(&self, log: &NewAuditLog) -> Result<SecurityAuditLog> {
        let conn = self.conn();
        let event_type = log.event_type.as_str();
        let category = log.event_type.category().as_str();
        let severity = log.event_type.severity().as_str();

        conn.execute(
            "INSERT INTO security_audit_logs
             (created_at, event_type, event_category, severity, actor_user_id, actor_username, actor_ip,
              actor_user_agent, target_type, target_id, target_name, success, failure_reason, metadata,
              server_id, stack_name, session_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                format_datetime(&log.created_at),
                event_type,
                category,
                severity,
                log.actor_user_id,
                log.actor_username,
                log.actor_ip,
                log.actor_user_agent,
                log.target_type,
                log.target_id,
                log.target_name,
                log.success,
                log.failure_reason,
                log.metadata.to_string(),
                log.server_id,
                log.stack_name,
                log.session_id,
            ],
        )?;

        Ok(SecurityAuditLog {
            id: conn.last_insert_rowid(),
            created_at: log.created_at,
            event_type: event_type.to_string(),
            event_category: category.to_string(),
            severity: severity.to_string(),
            actor_user_id: log.actor_user_id,
            actor_username: log.actor_username.clone(),
            actor_ip: log.actor_ip.clone(),
            actor_user_agent: log.actor_user_agent.clone(),
            target_type: log.target_type.clone(),
            target_id: log.target_id,
            target_name: log.target_name.clone(),
            success: log.success,
            failure_reason: log.failure_reason.clone(),
            metadata: log.metadata.clone(),
            server_id: log.server_id,
            stack_name: log.stack_name.clone(),
            session_id: log.session_id,
        })
    }

    fn list_security_audit_logs(&self, filter: &AuditLogFilter) -> Result<Vec<SecurityAuditLog>> {
        let mut sql = format!("SELECT {AUDIT_COLUMNS} FROM security_audit_logs WHERE 1 = 1");
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(event_type) = &filter.event_type {
            args.push(Box::new(event_type.clone()));
            sql.push_str(&format!(" AND event_type = ?{}", args.len()));
        }
        if let Some(category) = &filter.event_category {
            args.push(Box::new(category.clone()));
            sql.push_str(&format!(" AND event_category = ?{}", args.len()));
        }
        if let Some(severity) = &filter.severity {
            args.push(Box::new(severity.clone()));
            sql.push_str(&format!(" AND severity = ?{}", args.len()));
        }
        if let Some(user_id) = filter.actor_user_id {
            args.push(Box::new(user_id));
            sql.push_str(&format!(" AND actor_user_id = ?{}", args.len()));
        }
        args.push(Box::new(filter.limit));
        sql.push_str(&format!(" ORDER BY created_at DESC, id DESC LIMIT ?{}", args.len()));
        args.push(Box::new(filter.offset));
        sql.push_str(&format!(" OFFSET ?{}", args.len()));

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), audit_from_row)?;
        collect(rows)
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn store() -> SqliteStore {
        let store = SqliteStore::in_memory().unwrap();
        store.initialize().unwrap();
        store
    }

    fn server(store: &SqliteStore, name: &str) -> Server {
        store
            .create_server(&NewServer {
                name: name.to_string(),
                description: String::new(),
                host: "10.0.0.1".to_string(),
                port: 8080,
                skip_ssl_verification: false,
                access_token: "agent-token".to_string(),
                is_active: true,
            })
            .unwrap()
    }

    #[test]
    fn test_initialize_creates_tables_and_seeds() {
        let store = store();

        let tables: Vec<String> = {
            let conn = store.conn();
            let mut stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .unwrap();
            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .collect::<std::result::Result<Vec<_>, _>>()
                .unwrap()
        };

        for table in [
            "users",
            "roles",
            "permissions",
            "server_role_stack_permissions",
            "api_keys",
            "refresh_tokens",
            "user_sessions",
            "operation_logs",
            "security_audit_logs",
            "container_image_updates",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }

        assert_eq!(store.list_permissions().unwrap().len(), Permission::ALL.len());
        let admin = store.get_role_by_name(ADMIN_ROLE_NAME).unwrap().unwrap();
        assert!(admin.is_admin);

        // Seeding twice is harmless
        store.initialize().unwrap();
        assert_eq!(store.list_roles().unwrap().len(), 1);
    }

    #[test]
    fn test_user_crud_and_uniqueness() {
        let store = store();
        let user = store.create_user("alice", "alice@example.com", "hash").unwrap();

        let fetched = store.get_user_by_username("alice").unwrap().unwrap();
        assert_eq!(fetched.id, user.id);
        assert!(fetched.email_verified_at.is_none());

        let dup = store.create_user("alice", "other@example.com", "hash");
        assert!(matches!(dup, Err(Error::AlreadyExists)));

        store
            .update_user_email(user.id, "new@example.com", Some(Utc::now()))
            .unwrap();
        let fetched = store.get_user(user.id).unwrap().unwrap();
        assert_eq!(fetched.email, "new@example.com");
        assert!(fetched.email_verified_at.is_some());

        assert!(store.delete_user(user.id).unwrap());
        assert!(store.get_user(user.id).unwrap().is_none());
    }

    #[test]
    fn test_role_assignment_and_admin_flag() {
        let store = store();
        let user = store.create_user("bob", "", "hash").unwrap();
        assert!(!store.user_is_admin(user.id).unwrap());

        let admin = store.get_role_by_name(ADMIN_ROLE_NAME).unwrap().unwrap();
        assert!(store.assign_role(user.id, admin.id).unwrap());
        assert!(!store.assign_role(user.id, admin.id).unwrap());
        assert!(store.user_is_admin(user.id).unwrap());

        assert!(store.revoke_role(user.id, admin.id).unwrap());
        assert!(!store.user_is_admin(user.id).unwrap());
    }

    #[test]
    fn test_stack_permissions_through_roles() {
        let store = store();
        let user = store.create_user("u1", "", "hash").unwrap();
        let role = store.create_role("deployer", "", false).unwrap();
        let srv = server(&store, "one");
        let other = server(&store, "two");
        let manage = store.get_permission_by_name("stacks.manage").unwrap().unwrap();

        store.assign_role(user.id, role.id).unwrap();
        let grant = store
            .add_stack_permission(srv.id, role.id, manage.id, "web-*")
            .unwrap();
        assert_eq!(grant.permission, "stacks.manage");

        let dup = store.add_stack_permission(srv.id, role.id, manage.id, "web-*");
        assert!(matches!(dup, Err(Error::AlreadyExists)));

        let grants = store.list_user_stack_permissions(user.id, Some(srv.id)).unwrap();
        assert_eq!(grants.len(), 1);
        assert!(store
            .list_user_stack_permissions(user.id, Some(other.id))
            .unwrap()
            .is_empty());

        assert!(store.delete_stack_permission(role.id, grant.id).unwrap());
        assert!(store.list_user_stack_permissions(user.id, None).unwrap().is_empty());
    }

    #[test]
    fn test_api_key_prefix_collision() {
        let store = store();
        let user = store.create_user("carol", "", "hash").unwrap();
        store
            .create_api_key(user.id, "ci", "abcd1234", "hash1", None)
            .unwrap();

        let result = store.create_api_key(user.id, "ci-2", "abcd1234", "hash2", None);
        assert!(matches!(result, Err(Error::TokenLookupCollision)));
    }

    #[test]
    fn test_refresh_rotation_is_single_use() {
        let store = store();
        let user = store.create_user("dave", "", "hash").unwrap();
        let expires_at = Utc::now() + Duration::days(30);

        let first = store
            .create_refresh_token(&NewRefreshToken {
                user_id: user.id,
                token_hash: "h1".to_string(),
                family_id: "fam".to_string(),
                expires_at,
                session_info: String::new(),
            })
            .unwrap();
        store
            .create_session(&NewSession {
                user_id: user.id,
                token: UserSession::token_for_refresh_id(first.id),
                session_type: SessionType::Jwt,
                ip: "127.0.0.1".to_string(),
                user_agent: "test".to_string(),
                expires_at,
                jwt_access_jti: Some("jti-1".to_string()),
                refresh_token_id: Some(first.id),
            })
            .unwrap();

        let next = NewRefreshToken {
            user_id: user.id,
            token_hash: "h2".to_string(),
            family_id: "fam".to_string(),
            expires_at,
            session_info: String::new(),
        };
        let rotation = SessionRotation {
            jwt_access_jti: "jti-2".to_string(),
            expires_at,
        };

        let second = store
            .rotate_refresh_token(first.id, &next, &rotation)
            .unwrap()
            .unwrap();
        let session = store.get_session_by_refresh_id(second.id).unwrap().unwrap();
        assert_eq!(session.jwt_access_jti.as_deref(), Some("jti-2"));
        assert_eq!(session.token, UserSession::token_for_refresh_id(second.id));

        let replay = NewRefreshToken {
            token_hash: "h3".to_string(),
            ..next
        };
        assert!(store
            .rotate_refresh_token(first.id, &replay, &rotation)
            .unwrap()
            .is_none());
        assert!(store.get_refresh_token_by_hash("h3").unwrap().is_none());

        let jtis = store.revoke_refresh_family("fam").unwrap();
        assert_eq!(jtis, vec!["jti-2".to_string()]);
        assert!(store.list_user_sessions(user.id).unwrap().is_empty());
    }

    #[test]
    fn test_replace_image_updates_removes_stale_rows() {
        let store = store();
        let srv = server(&store, "imgs");
        let record = |stack: &str, container: &str| NewImageUpdate {
            stack_name: stack.to_string(),
            container_name: container.to_string(),
            current_image_name: "nginx:1.25".to_string(),
            current_repo_digest: "sha256:aaa".to_string(),
            latest_repo_digest: "sha256:bbb".to_string(),
            update_available: true,
            check_error: None,
        };

        let removed = store
            .replace_image_updates(srv.id, &[record("web", "web-1"), record("db", "db-1")], Utc::now())
            .unwrap();
        assert_eq!(removed, 0);

        let removed = store
            .replace_image_updates(srv.id, &[record("web", "web-1")], Utc::now())
            .unwrap();
        assert_eq!(removed, 1);

        let rows = store.list_image_updates(srv.id).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].container_name, "web-1");
    }

    #[test]
    fn test_totp_window_is_single_use() {
        let store = store();
        let user = store.create_user("erin", "", "hash").unwrap();

        assert!(store.record_totp_window(user.id, 1000).unwrap());
        assert!(!store.record_totp_window(user.id, 1000).unwrap());
        assert!(store.record_totp_window(user.id, 1001).unwrap());
        assert_eq!(store.delete_totp_windows_before(1001).unwrap(), 1);
    }

    #[test]
    fn test_pending_totp_cannot_overwrite_enabled() {
        let store = store();
        let user = store.create_user("frank", "", "hash").unwrap();

        store.upsert_pending_totp(user.id, "secret-1").unwrap();
        store.upsert_pending_totp(user.id, "secret-2").unwrap();
        assert!(store.enable_totp(user.id).unwrap());

        let result = store.upsert_pending_totp(user.id, "secret-3");
        assert!(matches!(result, Err(Error::Conflict(_))));
        assert_eq!(store.get_totp(user.id).unwrap().unwrap().encrypted_secret, "secret-2");
    }

    #[test]
    fn test_operation_messages_in_sequence_order() {
        let store = store();
        let log = store
            .create_operation_log(&NewOperationLog {
                user_id: 1,
                server_id: 1,
                stack_name: "web".to_string(),
                operation_id: "op-1".to_string(),
                command: "up".to_string(),
                options: vec!["-d".to_string()],
                services: vec![],
                start_time: Utc::now(),
            })
            .unwrap();

        let now = Utc::now();
        for (seq, kind) in [(1, MessageKind::Progress), (2, MessageKind::Stdout), (3, MessageKind::Complete)] {
            store
                .append_operation_message(
                    log.id,
                    &NewOperationMessage {
                        sequence: seq,
                        timestamp: now,
                        kind,
                        data: format!("line {seq}"),
                        exit_code: None,
                        success: None,
                    },
                )
                .unwrap();
        }

        store
            .finish_operation_log(
                log.id,
                &OperationOutcome {
                    end_time: Utc::now(),
                    success: true,
                    exit_code: Some(0),
                    failure_reason: None,
                },
            )
            .unwrap();

        let messages = store.list_operation_messages(log.id).unwrap();
        let kinds: Vec<_> = messages.iter().map(|m| m.kind).collect();
        assert_eq!(kinds, vec![MessageKind::Progress, MessageKind::Stdout, MessageKind::Complete]);

        let fetched = store.get_operation_log_by_operation_id("op-1").unwrap().unwrap();
        assert_eq!(fetched.options, vec!["-d".to_string()]);
        assert_eq!(fetched.success, Some(true));

        // A finished operation cannot be closed twice
        let again = store.finish_operation_log(
            log.id,
            &OperationOutcome {
                end_time: Utc::now(),
                success: false,
                exit_code: None,
                failure_reason: None,
            },
        );
        assert!(matches!(again, Err(Error::NotFound)));
    }

    #[test]
    fn test_audit_log_filters() {
        let store = store();
        let entry = |event_type| NewAuditLog {
            created_at: Utc::now(),
            event_type,
            actor_user_id: Some(1),
            actor_username: "alice".to_string(),
            actor_ip: "127.0.0.1".to_string(),
            actor_user_agent: String::new(),
            target_type: "user".to_string(),
            target_id: Some(1),
            target_name: "alice".to_string(),
            success: true,
            failure_reason: None,
            metadata: serde_json::json!({"k": "v"}),
            server_id: None,
            stack_name: None,
            session_id: None,
        };

        store.insert_security_audit_log(&entry(AuditEventType::LoginSuccess)).unwrap();
        store.insert_security_audit_log(&entry(AuditEventType::UserDeleted)).unwrap();

        let critical = store
            .list_security_audit_logs(&AuditLogFilter {
                severity: Some("critical".to_string()),
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].event_type, "user.deleted");
        assert_eq!(critical[0].metadata["k"], "v");
    }
}
