//! Runtime configuration, read from environment variables.
//!
//! Every setting has a default except `ENCRYPTION_SECRET` and `JWT_SECRET_KEY`.
//! Durations use humantime syntax (`15m`, `720h`).

mod server;

use std::path::PathBuf;
use std::time::Duration;

pub use server::ServerConfig;

use crate::error::{Error, Result};

const MIN_ENCRYPTION_SECRET_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl SameSite {
    pub fn as_str(self) -> &'static str {
        match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        }
    }
}

/// What to do when an already-rotated refresh token is presented again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReusePolicy {
    /// Reject and audit only.
    Report,
    /// Reject, audit, and revoke every token and session descended from the same login.
    RevokeFamily,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub secret: String,
    pub access_expiry: Duration,
    pub refresh_expiry: Duration,
    pub totp_pending_expiry: Duration,
    pub reuse_policy: ReusePolicy,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub secure: bool,
    pub same_site: SameSite,
    pub csrf_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Talk plain HTTP to agents instead of HTTPS.
    pub use_http: bool,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ImageUpdateConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub disabled_registries: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct OperationConfig {
    pub timeout: Duration,
    /// Zero keeps operation logs forever.
    pub retention_days: u32,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub log_dir: PathBuf,
    pub operation_log_to_file: bool,
    pub security_audit_log_to_file: bool,
    pub format: LogFormat,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database_dsn: String,
    pub encryption_secret: String,
    pub jwt: JwtConfig,
    pub session: SessionConfig,
    pub email_verification_required: bool,
    pub agent: AgentConfig,
    pub image_updates: ImageUpdateConfig,
    pub operations: OperationConfig,
    pub logging: LoggingConfig,
    pub rate_limit_enabled: bool,
    pub housekeeping_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup. Used by `from_env` and tests.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let encryption_secret = get("ENCRYPTION_SECRET")
            .ok_or_else(|| Error::Config("ENCRYPTION_SECRET is required".into()))?;
        if encryption_secret.chars().count() < MIN_ENCRYPTION_SECRET_LEN {
            return Err(Error::Config(format!(
                "ENCRYPTION_SECRET must be at least {MIN_ENCRYPTION_SECRET_LEN} characters"
            )));
        }

        let jwt_secret = get("JWT_SECRET_KEY")
            .ok_or_else(|| Error::Config("JWT_SECRET_KEY is required".into()))?;

        let rotation_mode = get("REFRESH_TOKEN_ROTATION_MODE").unwrap_or_else(|| "always".into());
        if rotation_mode != "always" {
            return Err(Error::Config(format!(
                "REFRESH_TOKEN_ROTATION_MODE '{rotation_mode}' is not supported; refresh tokens are single-use"
            )));
        }

        let reuse_policy = match get("REFRESH_TOKEN_REUSE_POLICY").as_deref() {
            None | Some("report") => ReusePolicy::Report,
            Some("revoke_family") => ReusePolicy::RevokeFamily,
            Some(other) => {
                return Err(Error::Config(format!(
                    "REFRESH_TOKEN_REUSE_POLICY must be 'report' or 'revoke_family', got '{other}'"
                )));
            }
        };

        let same_site = match get("SESSION_SAME_SITE")
            .map(|v| v.to_ascii_lowercase())
            .as_deref()
        {
            None | Some("strict") => SameSite::Strict,
            Some("lax") => SameSite::Lax,
            Some("none") => SameSite::None,
            Some(other) => {
                return Err(Error::Config(format!("invalid SESSION_SAME_SITE '{other}'")));
            }
        };

        let format = match get("LOG_FORMAT").as_deref() {
            None | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => return Err(Error::Config(format!("invalid LOG_FORMAT '{other}'"))),
        };

        let port = match get("PORT") {
            Some(p) => p
                .parse()
                .map_err(|_| Error::Config(format!("invalid PORT '{p}'")))?,
            None => ServerConfig::default().port,
        };

        let retention_days = match get("OPERATION_LOG_RETENTION_DAYS") {
            Some(v) => v
                .parse()
                .map_err(|_| Error::Config(format!("invalid OPERATION_LOG_RETENTION_DAYS '{v}'")))?,
            None => 0,
        };

        let operation_timeout = match get("OPERATION_TIMEOUT_SECONDS") {
            Some(v) => Duration::from_secs(
                v.parse()
                    .map_err(|_| Error::Config(format!("invalid OPERATION_TIMEOUT_SECONDS '{v}'")))?,
            ),
            None => Duration::from_secs(600),
        };

        let disabled_registries = get("IMAGE_UPDATE_CHECK_DISABLED_REGISTRIES")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            server: ServerConfig {
                host: get("HOST").unwrap_or_else(|| ServerConfig::default().host),
                port,
            },
            database_dsn: get("DATABASE_DSN").unwrap_or_else(|| "./data/berth.db".into()),
            encryption_secret,
            jwt: JwtConfig {
                secret: jwt_secret,
                access_expiry: duration(&get, "JWT_ACCESS_EXPIRY", "15m")?,
                refresh_expiry: duration(&get, "REFRESH_TOKEN_EXPIRY", "720h")?,
                totp_pending_expiry: duration(&get, "TOTP_PENDING_EXPIRY", "5m")?,
                reuse_policy,
            },
            session: SessionConfig {
                secure: flag(&get, "SESSION_SECURE", true)?,
                same_site,
                csrf_enabled: flag(&get, "CSRF_ENABLED", true)?,
            },
            email_verification_required: flag(&get, "EMAIL_VERIFICATION_REQUIRED", false)?,
            agent: AgentConfig {
                use_http: flag(&get, "AGENT_USE_HTTP", false)?,
                request_timeout: duration(&get, "AGENT_REQUEST_TIMEOUT", "30s")?,
            },
            image_updates: ImageUpdateConfig {
                enabled: flag(&get, "IMAGE_UPDATE_CHECK_ENABLED", false)?,
                interval: duration(&get, "IMAGE_UPDATE_CHECK_INTERVAL", "6h")?,
                disabled_registries,
            },
            operations: OperationConfig {
                timeout: operation_timeout,
                retention_days,
            },
            logging: LoggingConfig {
                log_dir: PathBuf::from(get("LOG_DIR").unwrap_or_else(|| "./data/logs".into())),
                operation_log_to_file: flag(&get, "OPERATION_LOG_LOG_TO_FILE", false)?,
                security_audit_log_to_file: flag(&get, "SECURITY_AUDIT_LOG_TO_FILE", false)?,
                format,
            },
            rate_limit_enabled: flag(&get, "RATE_LIMIT_ENABLED", true)?,
            housekeeping_interval: duration(&get, "HOUSEKEEPING_INTERVAL", "1h")?,
        })
    }

    /// SQLite path from the DSN, accepting an optional `sqlite://` prefix.
    #[must_use]
    pub fn database_path(&self) -> &str {
        self.database_dsn
            .strip_prefix("sqlite://")
            .unwrap_or(&self.database_dsn)
    }
}

fn duration<F>(get: &F, key: &str, default: &str) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = get(key).unwrap_or_else(|| default.to_string());
    humantime::parse_duration(&raw)
        .map_err(|e| Error::Config(format!("invalid duration for {key} '{raw}': {e}")))
}

fn flag<F>(get: &F, key: &str, default: bool) -> Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.to_ascii_lowercase()).as_deref() {
        None => Ok(default),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => Err(Error::Config(format!("invalid boolean for {key}: '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("ENCRYPTION_SECRET", "0123456789abcdef"),
            ("JWT_SECRET_KEY", "jwt"),
        ]))
        .unwrap();

        assert_eq!(config.jwt.access_expiry, Duration::from_secs(15 * 60));
        assert_eq!(config.jwt.refresh_expiry, Duration::from_secs(720 * 3600));
        assert_eq!(config.image_updates.interval, Duration::from_secs(6 * 3600));
        assert_eq!(config.operations.timeout, Duration::from_secs(600));
        assert!(config.session.secure);
        assert!(config.session.csrf_enabled);
        assert_eq!(config.session.same_site, SameSite::Strict);
        assert!(!config.image_updates.enabled);
        assert_eq!(config.jwt.reuse_policy, ReusePolicy::Report);
    }

    #[test]
    fn test_short_encryption_secret_fails_fast() {
        let result = Config::from_lookup(lookup(&[
            ("ENCRYPTION_SECRET", "too-short"),
            ("JWT_SECRET_KEY", "jwt"),
        ]));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_missing_jwt_secret() {
        let result = Config::from_lookup(lookup(&[("ENCRYPTION_SECRET", "0123456789abcdef")]));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_disabled_registries_and_dsn() {
        let config = Config::from_lookup(lookup(&[
            ("ENCRYPTION_SECRET", "0123456789abcdef"),
            ("JWT_SECRET_KEY", "jwt"),
            ("IMAGE_UPDATE_CHECK_DISABLED_REGISTRIES", "docker.io, ghcr.io,,"),
            ("DATABASE_DSN", "sqlite:///var/lib/berth.db"),
        ]))
        .unwrap();

        assert_eq!(
            config.image_updates.disabled_registries,
            vec!["docker.io".to_string(), "ghcr.io".to_string()]
        );
        assert_eq!(config.database_path(), "/var/lib/berth.db");
    }

    #[test]
    fn test_invalid_duration() {
        let result = Config::from_lookup(lookup(&[
            ("ENCRYPTION_SECRET", "0123456789abcdef"),
            ("JWT_SECRET_KEY", "jwt"),
            ("JWT_ACCESS_EXPIRY", "soon"),
        ]));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
