//! Periodic cleanup of expired credentials and old operation logs.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{RevocationStore, totp};
use crate::error::Result;
use crate::store::Store;

/// TOTP windows kept around for replay checks, on either side of now.
const TOTP_WINDOW_GRACE: i64 = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Purged {
    pub revoked_tokens: usize,
    pub refresh_tokens: usize,
    pub sessions: usize,
    pub totp_windows: usize,
    pub operation_logs: usize,
}

impl Purged {
    fn total(&self) -> usize {
        self.revoked_tokens
            + self.refresh_tokens
            + self.sessions
            + self.totp_windows
            + self.operation_logs
    }
}

pub struct Housekeeper {
    store: Arc<dyn Store>,
    revocations: Arc<RevocationStore>,
    retention_days: u32,
    interval: Duration,
}

impl Housekeeper {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        revocations: Arc<RevocationStore>,
        retention_days: u32,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            revocations,
            retention_days,
            interval,
        }
    }

    pub fn run_once(&self, now: DateTime<Utc>) -> Result<Purged> {
        let mut purged = Purged {
            revoked_tokens: self.revocations.purge_expired(now)?,
            refresh_tokens: self.store.delete_expired_refresh_tokens(now)?,
            sessions: self.store.delete_expired_sessions(now)?,
            totp_windows: self
                .store
                .delete_totp_windows_before(totp::window_for(now.timestamp()) - TOTP_WINDOW_GRACE)?,
            operation_logs: 0,
        };

        if self.retention_days > 0 {
            let cutoff = now - chrono::Duration::days(i64::from(self.retention_days));
            purged.operation_logs = self.store.delete_operation_logs_before(cutoff)?;
        }
        Ok(purged)
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => match self.run_once(Utc::now()) {
                    Ok(purged) if purged.total() > 0 => info!(
                        revoked_tokens = purged.revoked_tokens,
                        refresh_tokens = purged.refresh_tokens,
                        sessions = purged.sessions,
                        totp_windows = purged.totp_windows,
                        operation_logs = purged.operation_logs,
                        "Housekeeping purged expired records"
                    ),
                    Ok(_) => debug!("Housekeeping found nothing to purge"),
                    Err(e) => warn!("Housekeeping failed: {e}"),
                },
            }
        }
    }
}
