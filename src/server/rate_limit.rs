//! Per-client request budgets.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};

use super::AppState;
use super::response::ApiError;
use crate::auth::helpers::client_ip;

type Limiter = DefaultKeyedRateLimiter<String>;

fn quota(count: u32, period: Duration) -> Option<Quota> {
    let burst = NonZeroU32::new(count)?;
    Some(Quota::with_period(period / count)?.allow_burst(burst))
}

fn limiter(count: u32, period: Duration) -> Option<Limiter> {
    quota(count, period).map(RateLimiter::keyed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Login,
    Totp,
    Authenticated,
}

/// Keyed limiters for the password, TOTP and authenticated route groups.
pub struct RateLimits {
    login: Option<Limiter>,
    totp: Option<Limiter>,
    authenticated: Option<Limiter>,
}

impl RateLimits {
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        if !enabled {
            return Self::disabled();
        }
        Self {
            login: limiter(5, Duration::from_secs(60)),
            totp: limiter(3, Duration::from_secs(60)),
            authenticated: limiter(50, Duration::from_secs(180)),
        }
    }

    #[must_use]
    pub fn disabled() -> Self {
        Self {
            login: None,
            totp: None,
            authenticated: None,
        }
    }

    /// Spends one request from `key`'s budget. False means the caller is over.
    pub fn check(&self, bucket: Bucket, key: &str) -> bool {
        let limiter = match bucket {
            Bucket::Login => &self.login,
            Bucket::Totp => &self.totp,
            Bucket::Authenticated => &self.authenticated,
        };
        match limiter {
            Some(limiter) => limiter.check_key(&key.to_string()).is_ok(),
            None => true,
        }
    }

    /// Drops state for keys that are back to a full budget.
    pub fn shrink(&self) {
        for limiter in [&self.login, &self.totp, &self.authenticated]
            .into_iter()
            .flatten()
        {
            limiter.retain_recent();
            limiter.shrink_to_fit();
        }
    }
}

/// Guard for `/auth/login` and `/auth/session`.
pub struct LoginLimit;

/// Guard for `/auth/totp/verify`.
pub struct TotpLimit;

impl FromRequestParts<Arc<AppState>> for LoginLimit {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        if state.limits.check(Bucket::Login, &client_ip(parts)) {
            Ok(LoginLimit)
        } else {
            Err(ApiError::too_many_requests())
        }
    }
}

impl FromRequestParts<Arc<AppState>> for TotpLimit {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        if state.limits.check(Bucket::Totp, &client_ip(parts)) {
            Ok(TotpLimit)
        } else {
            Err(ApiError::too_many_requests())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_budget() {
        let limits = RateLimits::new(true);
        for _ in 0..5 {
            assert!(limits.check(Bucket::Login, "198.51.100.1"));
        }
        assert!(!limits.check(Bucket::Login, "198.51.100.1"));
        assert!(limits.check(Bucket::Login, "198.51.100.2"));
    }

    #[test]
    fn test_totp_budget_is_tighter() {
        let limits = RateLimits::new(true);
        for _ in 0..3 {
            assert!(limits.check(Bucket::Totp, "a"));
        }
        assert!(!limits.check(Bucket::Totp, "a"));
    }

    #[test]
    fn test_disabled_never_limits() {
        let limits = RateLimits::new(false);
        for _ in 0..100 {
            assert!(limits.check(Bucket::Login, "a"));
        }
    }
}
