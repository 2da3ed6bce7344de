use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::Serialize;
use serde_json::json;

use super::jwt::{Claims, JwtError, JwtService, TokenType};
use super::password::{burn_verification, hash_password, validate_password, verify_password};
use super::revocation::RevocationStore;
use super::token::{ApiKeyGenerator, parse_api_key, sha256_hex};
use super::totp;
use crate::audit::{Actor, AuditEvent, AuditLogger};
use crate::config::{JwtConfig, ReusePolicy};
use crate::crypto::Crypto;
use crate::error::Error;
use crate::store::{NewRefreshToken, NewSession, SessionRotation, Store};
use crate::types::{ApiKey, ApiKeyScope, AuditEventType, SessionType, User, UserSession};

const TOTP_ISSUER: &str = "Berth";
const SESSION_TOKEN_BYTES: usize = 32;

/// Authentication failures, each with a stable wire code.
#[derive(Debug)]
pub enum AuthError {
    InvalidCredentials,
    EmailNotVerified,
    InvalidToken,
    ExpiredToken,
    InvalidTotpCode,
    TotpNotEnabled,
    TotpAlreadyEnabled,
    Validation(String),
    NotFound,
    Internal(Error),
}

impl AuthError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::InvalidCredentials => "invalid_credentials",
            AuthError::EmailNotVerified => "email_not_verified",
            AuthError::InvalidToken => "invalid_token",
            AuthError::ExpiredToken => "expired_token",
            AuthError::InvalidTotpCode => "invalid_totp_code",
            AuthError::TotpNotEnabled => "totp_not_enabled",
            AuthError::TotpAlreadyEnabled => "totp_already_enabled",
            AuthError::Validation(_) => "validation_error",
            AuthError::NotFound => "not_found",
            AuthError::Internal(_) => "internal_error",
        }
    }
}

impl From<Error> for AuthError {
    fn from(e: Error) -> Self {
        match e {
            Error::BadRequest(msg) => AuthError::Validation(msg),
            other => AuthError::Internal(other),
        }
    }
}

impl From<JwtError> for AuthError {
    fn from(e: JwtError) -> Self {
        match e {
            JwtError::Expired => AuthError::ExpiredToken,
            JwtError::Invalid => AuthError::InvalidToken,
        }
    }
}

type AuthResult<T> = std::result::Result<T, AuthError>;

#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    pub expires_in: u64,
    pub refresh_expires_in: u64,
    pub user: User,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum LoginOutcome {
    Tokens(TokenPair),
    TotpRequired {
        totp_required: bool,
        temporary_token: String,
        expires_in: u64,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    #[serde(flatten)]
    pub session: UserSession,
    pub current: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TotpSetup {
    pub secret: String,
    pub otpauth_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TotpStatus {
    pub enabled: bool,
    pub pending: bool,
}

/// An authenticated access token.
#[derive(Debug, Clone)]
pub struct AccessContext {
    pub user: User,
    pub claims: Claims,
    pub session_id: Option<i64>,
}

/// An authenticated API key with its scopes.
#[derive(Debug, Clone)]
pub struct ApiKeyContext {
    pub user: User,
    pub key: ApiKey,
    pub scopes: Vec<ApiKeyScope>,
}

pub struct AuthService {
    store: Arc<dyn Store>,
    jwt: JwtService,
    revocations: Arc<RevocationStore>,
    crypto: Crypto,
    audit: Arc<AuditLogger>,
    keys: ApiKeyGenerator,
    email_verification_required: bool,
    reuse_policy: ReusePolicy,
}

fn seconds(d: std::time::Duration) -> u64 {
    d.as_secs()
}

fn chrono_duration(d: std::time::Duration) -> Duration {
    Duration::from_std(d).unwrap_or_else(|_| Duration::days(365 * 100))
}

impl AuthService {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        jwt_config: &JwtConfig,
        revocations: Arc<RevocationStore>,
        crypto: Crypto,
        audit: Arc<AuditLogger>,
        email_verification_required: bool,
    ) -> Self {
        Self {
            store,
            jwt: JwtService::new(jwt_config),
            revocations,
            crypto,
            audit,
            keys: ApiKeyGenerator::new(),
            email_verification_required,
            reuse_policy: jwt_config.reuse_policy,
        }
    }

    #[must_use]
    pub fn api_keys(&self) -> &ApiKeyGenerator {
        &self.keys
    }

    fn actor_for(user: &User, client: &Actor) -> Actor {
        Actor {
            user_id: Some(user.id),
            username: user.username.clone(),
            ..client.clone()
        }
    }

    fn access_expiry(&self) -> DateTime<Utc> {
        Utc::now() + chrono_duration(self.jwt.ttl(TokenType::Access))
    }

    // Login

    pub fn login(&self, username: &str, password: &str, client: &Actor) -> AuthResult<LoginOutcome> {
        let user = self.check_password(username, password, client)?;

        if self.totp_enabled(user.id)? {
            let (temporary_token, _) = self.jwt.issue(user.id, TokenType::TotpPending)?;
            return Ok(LoginOutcome::TotpRequired {
                totp_required: true,
                temporary_token,
                expires_in: seconds(self.jwt.ttl(TokenType::TotpPending)),
            });
        }

        let pair = self.issue_pair(&user, client)?;
        self.audit
            .record(AuditEvent::new(AuditEventType::LoginSuccess, &Self::actor_for(&user, client)));
        Ok(LoginOutcome::Tokens(pair))
    }

    /// Verifies username and password, auditing failures.
    fn check_password(&self, username: &str, password: &str, client: &Actor) -> AuthResult<User> {
        let Some(user) = self.store.get_user_by_username(username)? else {
            burn_verification(password);
            self.audit_auth_failure(client, username, "invalid_credentials");
            return Err(AuthError::InvalidCredentials);
        };

        if !verify_password(password, &user.password_hash)? {
            self.audit_auth_failure(client, username, "invalid_credentials");
            self.audit.record(
                AuditEvent::new(AuditEventType::LoginFailure, &Self::actor_for(&user, client))
                    .target("user", Some(user.id), &user.username)
                    .failed("invalid_credentials"),
            );
            return Err(AuthError::InvalidCredentials);
        }

        if self.email_verification_required && user.email_verified_at.is_none() {
            return Err(AuthError::EmailNotVerified);
        }

        Ok(user)
    }

    fn audit_auth_failure(&self, client: &Actor, username: &str, reason: &str) {
        let actor = Actor {
            username: username.to_string(),
            ..client.clone()
        };
        self.audit
            .record(AuditEvent::new(AuditEventType::ApiAuthFailed, &actor).failed(reason));
    }

    fn totp_enabled(&self, user_id: i64) -> AuthResult<bool> {
        Ok(self
            .store
            .get_totp(user_id)?
            .is_some_and(|t| t.enabled))
    }

    /// Issues an access and refresh pair and records the session linking them.
    fn issue_pair(&self, user: &User, client: &Actor) -> AuthResult<TokenPair> {
        let (access_token, access) = self.jwt.issue(user.id, TokenType::Access)?;
        let (refresh_token, refresh) = self.jwt.issue(user.id, TokenType::Refresh)?;

        let stored = self.store.create_refresh_token(&NewRefreshToken {
            user_id: user.id,
            token_hash: sha256_hex(&refresh_token),
            family_id: uuid::Uuid::new_v4().to_string(),
            expires_at: refresh.expires_at(),
            session_info: client.user_agent.clone(),
        })?;

        self.store.create_session(&NewSession {
            user_id: user.id,
            token: UserSession::token_for_refresh_id(stored.id),
            session_type: SessionType::Jwt,
            ip: client.ip.clone(),
            user_agent: client.user_agent.clone(),
            expires_at: refresh.expires_at(),
            jwt_access_jti: Some(access.jti.clone()),
            refresh_token_id: Some(stored.id),
        })?;

        if let Err(e) = self.store.update_user_last_login(user.id) {
            tracing::warn!(user_id = user.id, "Failed to update last login: {e}");
        }

        self.audit.record(
            AuditEvent::new(AuditEventType::ApiTokenIssued, &Self::actor_for(user, client))
                .target("user", Some(user.id), &user.username),
        );

        Ok(TokenPair {
            access_token,
            refresh_token,
            token_type: "Bearer",
            expires_in: seconds(self.jwt.ttl(TokenType::Access)),
            refresh_expires_in: seconds(self.jwt.ttl(TokenType::Refresh)),
            user: user.clone(),
        })
    }

    // TOTP login

    /// Upgrades a pending-TOTP token to a full token pair.
    pub fn verify_totp_login(
        &self,
        temporary_token: &str,
        code: &str,
        client: &Actor,
    ) -> AuthResult<TokenPair> {
        let claims = self.jwt.verify(temporary_token, TokenType::TotpPending)?;
        if self.revocations.is_revoked(&claims.jti) {
            return Err(AuthError::InvalidToken);
        }
        let user = self
            .store
            .get_user(claims.user_id()?)?
            .ok_or(AuthError::InvalidToken)?;
        let actor = Self::actor_for(&user, client);

        if let Err(e) = self.check_totp_code(&user, code) {
            self.audit.record(
                AuditEvent::new(AuditEventType::TotpVerificationFailure, &actor)
                    .target("user", Some(user.id), &user.username)
                    .failed(e.code()),
            );
            return Err(e);
        }

        // The pending token is single-use once it has been exchanged.
        self.revocations.revoke(&claims.jti, claims.expires_at())?;

        self.audit.record(
            AuditEvent::new(AuditEventType::TotpVerificationSuccess, &actor)
                .target("user", Some(user.id), &user.username),
        );
        self.audit
            .record(AuditEvent::new(AuditEventType::LoginSuccess, &actor).metadata(json!({"totp": true})));

        self.issue_pair(&user, client)
    }

    /// Checks a code against the enabled secret and burns its window.
    fn check_totp_code(&self, user: &User, code: &str) -> AuthResult<()> {
        let secret = self
            .store
            .get_totp(user.id)?
            .filter(|t| t.enabled)
            .ok_or(AuthError::TotpNotEnabled)?;
        let plain = self.crypto.decrypt(&secret.encrypted_secret)?;

        let window = totp::verify(&plain, code, Utc::now().timestamp())?
            .ok_or(AuthError::InvalidTotpCode)?;
        if !self.store.record_totp_window(user.id, window)? {
            return Err(AuthError::InvalidTotpCode);
        }
        Ok(())
    }

    // Refresh

    pub fn refresh(&self, refresh_token: &str, client: &Actor) -> AuthResult<TokenPair> {
        let claims = self.jwt.verify(refresh_token, TokenType::Refresh)?;

        let stored = self
            .store
            .get_refresh_token_by_hash(&sha256_hex(refresh_token))?
            .ok_or(AuthError::InvalidToken)?;

        if stored.revoked_at.is_some() {
            self.handle_reuse(&stored.family_id, stored.user_id, client);
            return Err(AuthError::InvalidToken);
        }
        if stored.expires_at < Utc::now() {
            return Err(AuthError::ExpiredToken);
        }

        let user = self
            .store
            .get_user(claims.user_id()?)?
            .filter(|u| u.id == stored.user_id)
            .ok_or(AuthError::InvalidToken)?;

        let (access_token, access) = self.jwt.issue(user.id, TokenType::Access)?;
        let (new_refresh_token, refresh) = self.jwt.issue(user.id, TokenType::Refresh)?;

        let rotated = self.store.rotate_refresh_token(
            stored.id,
            &NewRefreshToken {
                user_id: user.id,
                token_hash: sha256_hex(&new_refresh_token),
                family_id: stored.family_id.clone(),
                expires_at: refresh.expires_at(),
                session_info: stored.session_info.clone(),
            },
            &SessionRotation {
                jwt_access_jti: access.jti,
                expires_at: refresh.expires_at(),
            },
        )?;

        if rotated.is_none() {
            // Lost a race with another rotation of the same token.
            self.handle_reuse(&stored.family_id, stored.user_id, client);
            return Err(AuthError::InvalidToken);
        }

        self.audit.record(
            AuditEvent::new(AuditEventType::ApiTokenRefreshed, &Self::actor_for(&user, client))
                .target("user", Some(user.id), &user.username),
        );

        Ok(TokenPair {
            access_token,
            refresh_token: new_refresh_token,
            token_type: "Bearer",
            expires_in: seconds(self.jwt.ttl(TokenType::Access)),
            refresh_expires_in: seconds(self.jwt.ttl(TokenType::Refresh)),
            user,
        })
    }

    fn handle_reuse(&self, family_id: &str, user_id: i64, client: &Actor) {
        let revoke = self.reuse_policy == ReusePolicy::RevokeFamily;
        tracing::warn!(user_id, family_id, revoke, "Rotated refresh token presented again");

        let actor = Actor {
            user_id: Some(user_id),
            ..client.clone()
        };
        self.audit.record(
            AuditEvent::new(AuditEventType::ApiAuthFailed, &actor)
                .target("user", Some(user_id), "")
                .failed("refresh_token_reuse")
                .metadata(json!({ "family_id": family_id, "family_revoked": revoke })),
        );

        if !revoke {
            return;
        }
        match self.store.revoke_refresh_family(family_id) {
            Ok(jtis) => {
                let expires_at = self.access_expiry();
                for jti in jtis {
                    if let Err(e) = self.revocations.revoke(&jti, expires_at) {
                        tracing::error!("Failed to revoke access token {jti}: {e}");
                    }
                }
            }
            Err(e) => tracing::error!(family_id, "Failed to revoke refresh family: {e}"),
        }
    }

    // Logout

    /// Revokes the presented access token and, when given, its refresh token.
    pub fn logout(
        &self,
        access: &AccessContext,
        refresh_token: Option<&str>,
        client: &Actor,
    ) -> AuthResult<Vec<&'static str>> {
        let mut revoked = Vec::new();

        self.revocations
            .revoke(&access.claims.jti, self.access_expiry())?;
        revoked.push("access_token");

        if let Some(raw) = refresh_token.filter(|t| !t.is_empty()) {
            let stored = self
                .store
                .get_refresh_token_by_hash(&sha256_hex(raw))?
                .filter(|stored| stored.user_id == access.user.id);
            if let Some(stored) = stored {
                if self.store.revoke_refresh_token(stored.id)? {
                    revoked.push("refresh_token");
                }
                if let Some(session) = self.store.get_session_by_refresh_id(stored.id)? {
                    self.store.delete_session(session.id)?;
                }
            }
        }

        if let Some(session) = self.store.get_session_by_jti(&access.claims.jti)? {
            self.store.delete_session(session.id)?;
        }

        self.audit.record(
            AuditEvent::new(AuditEventType::Logout, &Self::actor_for(&access.user, client))
                .metadata(json!({ "revoked_tokens": revoked })),
        );
        Ok(revoked)
    }

    // Credential validation

    pub fn authenticate_access(&self, token: &str) -> AuthResult<AccessContext> {
        let claims = self.jwt.verify(token, TokenType::Access)?;
        if self.revocations.is_revoked(&claims.jti) {
            return Err(AuthError::InvalidToken);
        }

        let user = self
            .store
            .get_user(claims.user_id()?)?
            .ok_or(AuthError::InvalidToken)?;
        let session_id = self.store.get_session_by_jti(&claims.jti)?.map(|s| s.id);

        Ok(AccessContext {
            user,
            claims,
            session_id,
        })
    }

    /// Validates a pending-TOTP bearer without consuming it.
    pub fn authenticate_totp_pending(&self, token: &str) -> AuthResult<Claims> {
        let claims = self.jwt.verify(token, TokenType::TotpPending)?;
        if self.revocations.is_revoked(&claims.jti) {
            return Err(AuthError::InvalidToken);
        }
        Ok(claims)
    }

    pub fn authenticate_api_key(&self, raw: &str) -> AuthResult<ApiKeyContext> {
        let (prefix, _) = parse_api_key(raw).map_err(|_| AuthError::InvalidToken)?;
        let key = self
            .store
            .get_api_key_by_prefix(&prefix)?
            .ok_or(AuthError::InvalidToken)?;

        if !self.keys.verify(raw, &key.key_hash)? {
            return Err(AuthError::InvalidToken);
        }
        if key.expires_at.is_some_and(|e| e < Utc::now()) {
            return Err(AuthError::ExpiredToken);
        }

        let user = self
            .store
            .get_user(key.user_id)?
            .ok_or(AuthError::InvalidToken)?;
        if self.email_verification_required && user.email_verified_at.is_none() {
            return Err(AuthError::EmailNotVerified);
        }

        if let Err(e) = self.store.update_api_key_last_used(key.id) {
            tracing::warn!("Failed to update api key last_used_at: {e}");
        }
        let scopes = self.store.list_api_key_scopes(key.id)?;

        Ok(ApiKeyContext { user, key, scopes })
    }

    // Cookie sessions

    /// Creates a browser session. Returns the raw cookie value.
    pub fn create_cookie_session(
        &self,
        username: &str,
        password: &str,
        client: &Actor,
    ) -> AuthResult<(String, UserSession)> {
        let user = self.check_password(username, password, client)?;
        if self.totp_enabled(user.id)? {
            // Browser sessions for TOTP users go through the token flow.
            return Err(AuthError::Validation(
                "two-factor users must sign in with /auth/login".into(),
            ));
        }

        let mut bytes = [0u8; SESSION_TOKEN_BYTES];
        rand::thread_rng().fill(&mut bytes);
        let raw = hex::encode(bytes);

        let session = self.store.create_session(&NewSession {
            user_id: user.id,
            token: sha256_hex(&raw),
            session_type: SessionType::Session,
            ip: client.ip.clone(),
            user_agent: client.user_agent.clone(),
            expires_at: Utc::now() + chrono_duration(self.jwt.ttl(TokenType::Refresh)),
            jwt_access_jti: None,
            refresh_token_id: None,
        })?;

        if let Err(e) = self.store.update_user_last_login(user.id) {
            tracing::warn!(user_id = user.id, "Failed to update last login: {e}");
        }
        self.audit.record(
            AuditEvent::new(AuditEventType::LoginSuccess, &Self::actor_for(&user, client))
                .metadata(json!({ "session_type": "session" })),
        );
        Ok((raw, session))
    }

    pub fn authenticate_cookie(&self, raw: &str) -> AuthResult<(User, UserSession)> {
        let session = self
            .store
            .get_session_by_token(&sha256_hex(raw))?
            .filter(|s| s.session_type == SessionType::Session)
            .ok_or(AuthError::InvalidToken)?;

        if session.expires_at < Utc::now() {
            self.store.delete_session(session.id)?;
            return Err(AuthError::ExpiredToken);
        }

        let user = self
            .store
            .get_user(session.user_id)?
            .ok_or(AuthError::InvalidToken)?;
        if let Err(e) = self.store.touch_session(session.id) {
            tracing::warn!("Failed to touch session: {e}");
        }
        Ok((user, session))
    }

    // Session management

    /// Lists the user's sessions, flagging the caller's own.
    pub fn list_sessions(
        &self,
        user_id: i64,
        current_session_id: Option<i64>,
        refresh_token: Option<&str>,
    ) -> AuthResult<Vec<SessionView>> {
        let current_token = match refresh_token.filter(|t| !t.is_empty()) {
            Some(raw) => self
                .store
                .get_refresh_token_by_hash(&sha256_hex(raw))?
                .map(|r| UserSession::token_for_refresh_id(r.id)),
            None => None,
        };

        let now = Utc::now();
        Ok(self
            .store
            .list_user_sessions(user_id)?
            .into_iter()
            .filter(|s| s.expires_at > now)
            .map(|session| {
                let current = Some(session.id) == current_session_id
                    || current_token.as_deref() == Some(session.token.as_str());
                SessionView { session, current }
            })
            .collect())
    }

    fn end_session(&self, session: &UserSession) -> AuthResult<()> {
        if let Some(jti) = &session.jwt_access_jti {
            self.revocations.revoke(jti, self.access_expiry())?;
        }
        if let Some(refresh_id) = session.refresh_token_id {
            self.store.revoke_refresh_token(refresh_id)?;
        }
        Ok(())
    }

    pub fn revoke_session(&self, user: &User, session_id: i64, client: &Actor) -> AuthResult<()> {
        let session = self
            .store
            .get_session(session_id)?
            .filter(|s| s.user_id == user.id)
            .ok_or(AuthError::NotFound)?;

        self.end_session(&session)?;
        self.store.delete_session(session.id)?;

        self.audit.record(
            AuditEvent::new(AuditEventType::SessionRevoked, &Self::actor_for(user, client))
                .target("session", Some(session.id), &session.user_agent),
        );
        Ok(())
    }

    /// Ends every session except `keep`. Returns how many were revoked.
    pub fn revoke_other_sessions(
        &self,
        user: &User,
        keep: Option<i64>,
        client: &Actor,
    ) -> AuthResult<usize> {
        let removed = self.store.delete_user_sessions(user.id, keep)?;
        for session in &removed {
            self.end_session(session)?;
        }

        self.audit.record(
            AuditEvent::new(AuditEventType::SessionsRevokedAll, &Self::actor_for(user, client))
                .metadata(json!({ "revoked": removed.len() })),
        );
        Ok(removed.len())
    }

    // TOTP enrolment

    pub fn totp_status(&self, user_id: i64) -> AuthResult<TotpStatus> {
        let totp = self.store.get_totp(user_id)?;
        Ok(TotpStatus {
            enabled: totp.as_ref().is_some_and(|t| t.enabled),
            pending: totp.as_ref().is_some_and(|t| !t.enabled),
        })
    }

    pub fn totp_setup(&self, user: &User, client: &Actor) -> AuthResult<TotpSetup> {
        if self.totp_enabled(user.id)? {
            return Err(AuthError::TotpAlreadyEnabled);
        }

        let secret = totp::generate_secret();
        self.store
            .upsert_pending_totp(user.id, &self.crypto.encrypt(&secret)?)
            .map_err(|e| match e {
                Error::Conflict(_) => AuthError::TotpAlreadyEnabled,
                other => AuthError::Internal(other),
            })?;

        self.audit
            .record(AuditEvent::new(AuditEventType::TotpSetupInitiated, &Self::actor_for(user, client)));

        let account = if user.email.is_empty() {
            &user.username
        } else {
            &user.email
        };
        Ok(TotpSetup {
            otpauth_url: totp::otpauth_url(TOTP_ISSUER, account, &secret),
            secret,
        })
    }

    pub fn totp_enable(&self, user: &User, code: &str, client: &Actor) -> AuthResult<()> {
        let pending = self
            .store
            .get_totp(user.id)?
            .ok_or(AuthError::TotpNotEnabled)?;
        if pending.enabled {
            return Err(AuthError::TotpAlreadyEnabled);
        }

        let plain = self.crypto.decrypt(&pending.encrypted_secret)?;
        let window = totp::verify(&plain, code, Utc::now().timestamp())?
            .ok_or(AuthError::InvalidTotpCode)?;
        if !self.store.record_totp_window(user.id, window)? {
            return Err(AuthError::InvalidTotpCode);
        }

        self.store.enable_totp(user.id)?;
        self.audit.record(
            AuditEvent::new(AuditEventType::TotpEnabled, &Self::actor_for(user, client))
                .target("user", Some(user.id), &user.username),
        );
        Ok(())
    }

    /// Disabling requires a current code and the account password.
    pub fn totp_disable(
        &self,
        user: &User,
        code: &str,
        password: &str,
        client: &Actor,
    ) -> AuthResult<()> {
        if !verify_password(password, &user.password_hash)? {
            return Err(AuthError::InvalidCredentials);
        }
        self.check_totp_code(user, code)?;

        self.store.delete_totp(user.id)?;
        self.audit.record(
            AuditEvent::new(AuditEventType::TotpDisabled, &Self::actor_for(user, client))
                .target("user", Some(user.id), &user.username),
        );
        Ok(())
    }

    // Profile

    pub fn change_password(
        &self,
        user: &User,
        current: &str,
        new: &str,
        client: &Actor,
    ) -> AuthResult<()> {
        if !verify_password(current, &user.password_hash)? {
            return Err(AuthError::InvalidCredentials);
        }
        validate_password(new)?;

        self.store.update_user_password(user.id, &hash_password(new)?)?;
        self.audit.record(
            AuditEvent::new(AuditEventType::UserPasswordChanged, &Self::actor_for(user, client))
                .target("user", Some(user.id), &user.username),
        );
        Ok(())
    }

    pub fn change_email(&self, user: &User, email: &str, client: &Actor) -> AuthResult<()> {
        self.store.update_user_email(user.id, email, None)?;
        self.audit.record(
            AuditEvent::new(AuditEventType::UserEmailChanged, &Self::actor_for(user, client))
                .target("user", Some(user.id), &user.username)
                .metadata(json!({ "previous": user.email, "email": email })),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use super::*;
    use crate::store::SqliteStore;

    struct Fixture {
        store: Arc<dyn Store>,
        auth: AuthService,
        crypto: Crypto,
        revocations: Arc<RevocationStore>,
    }

    fn fixture(policy: ReusePolicy) -> Fixture {
        let db = SqliteStore::in_memory().unwrap();
        db.initialize().unwrap();
        let store: Arc<dyn Store> = Arc::new(db);
        let crypto = Crypto::new("0123456789abcdef-test");
        let revocations = Arc::new(RevocationStore::new(store.clone()));
        let audit = Arc::new(AuditLogger::new(store.clone(), None, false, false));
        let config = JwtConfig {
            secret: "jwt-test".into(),
            access_expiry: StdDuration::from_secs(900),
            refresh_expiry: StdDuration::from_secs(3600),
            totp_pending_expiry: StdDuration::from_secs(300),
            reuse_policy: policy,
        };

        store
            .create_user("alice", "alice@example.com", &hash_password("Pw!secret1").unwrap())
            .unwrap();

        Fixture {
            auth: AuthService::new(store.clone(), &config, revocations.clone(), crypto.clone(), audit, false),
            store,
            crypto,
            revocations,
        }
    }

    fn client() -> Actor {
        Actor::anonymous("127.0.0.1", "test")
    }

    fn tokens(outcome: LoginOutcome) -> TokenPair {
        match outcome {
            LoginOutcome::Tokens(pair) => pair,
            LoginOutcome::TotpRequired { .. } => panic!("expected tokens"),
        }
    }

    #[test]
    fn test_login_wrong_password() {
        let f = fixture(ReusePolicy::Report);
        let err = f.auth.login("alice", "nope", &client()).unwrap_err();
        assert_eq!(err.code(), "invalid_credentials");

        let err = f.auth.login("nobody", "nope", &client()).unwrap_err();
        assert_eq!(err.code(), "invalid_credentials");
    }

    #[test]
    fn test_refresh_is_single_use() {
        let f = fixture(ReusePolicy::Report);
        let pair = tokens(f.auth.login("alice", "Pw!secret1", &client()).unwrap());

        let second = f.auth.refresh(&pair.refresh_token, &client()).unwrap();
        assert_ne!(second.refresh_token, pair.refresh_token);

        let replay = f.auth.refresh(&pair.refresh_token, &client()).unwrap_err();
        assert_eq!(replay.code(), "invalid_token");

        // Report-only policy leaves the live chain usable.
        assert!(f.auth.authenticate_access(&second.access_token).is_ok());
        assert!(f.auth.refresh(&second.refresh_token, &client()).is_ok());
    }

    #[test]
    fn test_reuse_revokes_family() {
        let f = fixture(ReusePolicy::RevokeFamily);
        let pair = tokens(f.auth.login("alice", "Pw!secret1", &client()).unwrap());
        let second = f.auth.refresh(&pair.refresh_token, &client()).unwrap();

        assert!(f.auth.refresh(&pair.refresh_token, &client()).is_err());

        assert_eq!(
            f.auth.authenticate_access(&second.access_token).unwrap_err().code(),
            "invalid_token"
        );
        assert!(f.auth.refresh(&second.refresh_token, &client()).is_err());
    }

    #[test]
    fn test_logout_revokes_both_tokens() {
        let f = fixture(ReusePolicy::Report);
        let pair = tokens(f.auth.login("alice", "Pw!secret1", &client()).unwrap());
        let access = f.auth.authenticate_access(&pair.access_token).unwrap();
        assert!(access.session_id.is_some());

        let revoked = f
            .auth
            .logout(&access, Some(&pair.refresh_token), &client())
            .unwrap();
        assert_eq!(revoked, vec!["access_token", "refresh_token"]);
        assert!(f.revocations.is_revoked(&access.claims.jti));
        assert!(f.auth.authenticate_access(&pair.access_token).is_err());
        assert!(f.auth.refresh(&pair.refresh_token, &client()).is_err());
        assert!(f.store.list_user_sessions(access.user.id).unwrap().is_empty());
    }

    #[test]
    fn test_logout_ignores_foreign_refresh_token() {
        let f = fixture(ReusePolicy::Report);
        f.store
            .create_user("bob", "bob@example.com", &hash_password("Pw!secret2").unwrap())
            .unwrap();
        let alice = tokens(f.auth.login("alice", "Pw!secret1", &client()).unwrap());
        let bob = tokens(f.auth.login("bob", "Pw!secret2", &client()).unwrap());
        let bob_access = f.auth.authenticate_access(&bob.access_token).unwrap();

        let access = f.auth.authenticate_access(&alice.access_token).unwrap();
        let revoked = f
            .auth
            .logout(&access, Some(&bob.refresh_token), &client())
            .unwrap();
        assert_eq!(revoked, vec!["access_token"]);

        assert_eq!(f.store.list_user_sessions(bob_access.user.id).unwrap().len(), 1);
        assert!(f.auth.authenticate_access(&bob.access_token).is_ok());
        assert!(f.auth.refresh(&bob.refresh_token, &client()).is_ok());
    }

    #[test]
    fn test_totp_login_flow() {
        let f = fixture(ReusePolicy::Report);
        let user = f.store.get_user_by_username("alice").unwrap().unwrap();

        let setup = f.auth.totp_setup(&user, &client()).unwrap();
        let now = Utc::now().timestamp();
        let code = totp::code_for_window(&setup.secret, totp::window_for(now)).unwrap();
        f.auth.totp_enable(&user, &code, &client()).unwrap();
        assert!(f.auth.totp_status(user.id).unwrap().enabled);

        let temporary_token = match f.auth.login("alice", "Pw!secret1", &client()).unwrap() {
            LoginOutcome::TotpRequired {
                temporary_token, ..
            } => temporary_token,
            LoginOutcome::Tokens(_) => panic!("expected totp challenge"),
        };

        // The enabling code's window is already burned.
        let replay = f
            .auth
            .verify_totp_login(&temporary_token, &code, &client())
            .unwrap_err();
        assert_eq!(replay.code(), "invalid_totp_code");

        let next = code_for_unused_window(&f, user.id, &setup.secret);
        let pair = f
            .auth
            .verify_totp_login(&temporary_token, &next, &client())
            .unwrap();
        assert_eq!(pair.expires_in, 900);

        // The pending token cannot be exchanged twice.
        assert!(f
            .auth
            .verify_totp_login(&temporary_token, &next, &client())
            .is_err());
        let stored = f.store.get_totp(user.id).unwrap().unwrap();
        assert_ne!(f.crypto.decrypt(&stored.encrypted_secret).unwrap(), "");
    }

    fn code_for_unused_window(f: &Fixture, user_id: i64, secret: &str) -> String {
        // The next window is inside the skew and has not been consumed yet.
        let next = totp::window_for(Utc::now().timestamp()) + 1;
        assert!(f.store.get_totp(user_id).unwrap().is_some());
        totp::code_for_window(secret, next).unwrap()
    }

    #[test]
    fn test_api_key_authentication() {
        let f = fixture(ReusePolicy::Report);
        let user = f.store.get_user_by_username("alice").unwrap().unwrap();
        let (raw, prefix, hash) = f.auth.api_keys().generate().unwrap();
        f.store
            .create_api_key(user.id, "ci", &prefix, &hash, None)
            .unwrap();

        let ctx = f.auth.authenticate_api_key(&raw).unwrap();
        assert_eq!(ctx.user.id, user.id);
        assert!(ctx.scopes.is_empty());

        let tampered = format!("{}0000", &raw[..raw.len() - 4]);
        if tampered != raw {
            assert!(f.auth.authenticate_api_key(&tampered).is_err());
        }
    }

    #[test]
    fn test_expired_api_key() {
        let f = fixture(ReusePolicy::Report);
        let user = f.store.get_user_by_username("alice").unwrap().unwrap();
        let (raw, prefix, hash) = f.auth.api_keys().generate().unwrap();
        f.store
            .create_api_key(user.id, "old", &prefix, &hash, Some(Utc::now() - Duration::days(1)))
            .unwrap();

        assert_eq!(f.auth.authenticate_api_key(&raw).unwrap_err().code(), "expired_token");
    }

    #[test]
    fn test_cookie_session_round_trip() {
        let f = fixture(ReusePolicy::Report);
        let (raw, session) = f
            .auth
            .create_cookie_session("alice", "Pw!secret1", &client())
            .unwrap();

        let (user, found) = f.auth.authenticate_cookie(&raw).unwrap();
        assert_eq!(user.username, "alice");
        assert_eq!(found.id, session.id);
        assert!(f.auth.authenticate_cookie("not-a-session").is_err());
    }

    #[test]
    fn test_revoke_other_sessions() {
        let f = fixture(ReusePolicy::Report);
        let first = tokens(f.auth.login("alice", "Pw!secret1", &client()).unwrap());
        let second = tokens(f.auth.login("alice", "Pw!secret1", &client()).unwrap());

        let keep = f.auth.authenticate_access(&second.access_token).unwrap();
        let views = f
            .auth
            .list_sessions(keep.user.id, keep.session_id, None)
            .unwrap();
        assert_eq!(views.len(), 2);
        assert_eq!(views.iter().filter(|v| v.current).count(), 1);

        let revoked = f
            .auth
            .revoke_other_sessions(&keep.user, keep.session_id, &client())
            .unwrap();
        assert_eq!(revoked, 1);
        assert!(f.auth.authenticate_access(&first.access_token).is_err());
        assert!(f.auth.authenticate_access(&second.access_token).is_ok());
    }

    #[test]
    fn test_change_password() {
        let f = fixture(ReusePolicy::Report);
        let user = f.store.get_user_by_username("alice").unwrap().unwrap();

        assert!(f
            .auth
            .change_password(&user, "wrong", "new-password-1", &client())
            .is_err());
        f.auth
            .change_password(&user, "Pw!secret1", "new-password-1", &client())
            .unwrap();
        assert!(f.auth.login("alice", "new-password-1", &client()).is_ok());
    }
}
