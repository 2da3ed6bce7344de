use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::error::Result;
use crate::store::Store;

/// Access-token JTIs rejected before their natural expiry.
///
/// Backed by the `revoked_tokens` table and mirrored in memory so the per-request
/// check never touches the database.
pub struct RevocationStore {
    store: Arc<dyn Store>,
    entries: DashMap<String, DateTime<Utc>>,
}

impl RevocationStore {
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            entries: DashMap::new(),
        }
    }

    /// Loads persisted revocations that have not yet expired.
    pub fn load(&self) -> Result<usize> {
        let now = Utc::now();
        let mut loaded = 0;
        for (jti, expires_at) in self.store.list_revoked_tokens()? {
            if expires_at > now {
                self.entries.insert(jti, expires_at);
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    pub fn revoke(&self, jti: &str, expires_at: DateTime<Utc>) -> Result<()> {
        self.store.insert_revoked_token(jti, expires_at)?;
        self.entries.insert(jti.to_string(), expires_at);
        Ok(())
    }

    #[must_use]
    pub fn is_revoked(&self, jti: &str) -> bool {
        self.entries.contains_key(jti)
    }

    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        self.entries.retain(|_, expires_at| *expires_at > now);
        self.store.delete_expired_revoked_tokens(now)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::store::SqliteStore;

    fn store() -> Arc<dyn Store> {
        let store = SqliteStore::in_memory().unwrap();
        store.initialize().unwrap();
        Arc::new(store)
    }

    #[test]
    fn test_revoke_and_reload() {
        let db = store();
        let revocations = RevocationStore::new(db.clone());
        revocations
            .revoke("jti-1", Utc::now() + Duration::minutes(15))
            .unwrap();
        assert!(revocations.is_revoked("jti-1"));
        assert!(!revocations.is_revoked("jti-2"));

        let reloaded = RevocationStore::new(db);
        assert_eq!(reloaded.load().unwrap(), 1);
        assert!(reloaded.is_revoked("jti-1"));
    }

    #[test]
    fn test_purge_expired() {
        let revocations = RevocationStore::new(store());
        revocations
            .revoke("old", Utc::now() - Duration::minutes(1))
            .unwrap();
        revocations
            .revoke("new", Utc::now() + Duration::minutes(10))
            .unwrap();

        assert_eq!(revocations.purge_expired(Utc::now()).unwrap(), 1);
        assert!(!revocations.is_revoked("old"));
        assert!(revocations.is_revoked("new"));
        assert_eq!(revocations.len(), 1);
    }
}
