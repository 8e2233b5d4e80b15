use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::{to_chrono, Clock};
use crate::error::X402Error;
use crate::storage::{lock, open_sqlite};

/// Time-bounded permission for a subject to access one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessGrant {
    pub subject_id: String,
    pub resource_id: String,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AccessGrant {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Trait for grant storage backends.
///
/// Implementations must be thread-safe (`Send + Sync`) and make `grant`
/// an atomic check-then-set on the (subject, resource) key.
pub trait GrantStore: Send + Sync {
    /// Whether a non-expired grant exists. Expired grants are evicted.
    fn has_valid_grant(&self, subject_id: &str, resource_id: &str) -> bool;

    /// Issue or refresh a grant lasting `ttl` from now.
    ///
    /// An existing grant is never shortened: the stored expiry is the later of
    /// the current one and `now + ttl`. Returns the grant as stored.
    fn grant(
        &self,
        subject_id: &str,
        resource_id: &str,
        ttl: Duration,
    ) -> Result<AccessGrant, X402Error>;

    /// Remove a grant. Returns whether one existed.
    fn revoke(&self, subject_id: &str, resource_id: &str) -> bool;

    /// Evict every grant expired at the current time. Returns number purged.
    fn purge_expired(&self) -> usize;
}

type Key = (String, String);

/// In-memory grant store backed by DashMap. Fast but lost on restart.
pub struct InMemoryGrantStore {
    grants: DashMap<Key, AccessGrant>,
    clock: Arc<dyn Clock>,
}

impl InMemoryGrantStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            grants: DashMap::new(),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }

    /// Current grant for the pair, expired or not.
    pub fn get(&self, subject_id: &str, resource_id: &str) -> Option<AccessGrant> {
        self.grants
            .get(&(subject_id.to_string(), resource_id.to_string()))
            .map(|g| g.clone())
    }
}

impl GrantStore for InMemoryGrantStore {
    fn has_valid_grant(&self, subject_id: &str, resource_id: &str) -> bool {
        let key = (subject_id.to_string(), resource_id.to_string());
        let now = self.clock.now();
        // remove_if holds the shard lock, so a concurrent refresh cannot be evicted.
        if self
            .grants
            .remove_if(&key, |_, g| !g.is_valid_at(now))
            .is_some()
        {
            tracing::debug!(subject = %subject_id, resource = %resource_id, "evicted expired grant");
            return false;
        }
        self.grants.contains_key(&key)
    }

    fn grant(
        &self,
        subject_id: &str,
        resource_id: &str,
        ttl: Duration,
    ) -> Result<AccessGrant, X402Error> {
        let now = self.clock.now();
        let expires_at = now + to_chrono(ttl);
        let key = (subject_id.to_string(), resource_id.to_string());

        let grant = match self.grants.entry(key) {
            Entry::Occupied(mut o) if o.get().is_valid_at(now) => {
                let existing = o.get_mut();
                if expires_at > existing.expires_at {
                    existing.expires_at = expires_at;
                }
                existing.clone()
            }
            Entry::Occupied(mut o) => {
                let fresh = AccessGrant {
                    subject_id: subject_id.to_string(),
                    resource_id: resource_id.to_string(),
                    granted_at: now,
                    expires_at,
                };
                o.insert(fresh.clone());
                fresh
            }
            Entry::Vacant(v) => v
                .insert(AccessGrant {
                    subject_id: subject_id.to_string(),
                    resource_id: resource_id.to_string(),
                    granted_at: now,
                    expires_at,
                })
                .clone(),
        };
        Ok(grant)
    }

    fn revoke(&self, subject_id: &str, resource_id: &str) -> bool {
        self.grants
            .remove(&(subject_id.to_string(), resource_id.to_string()))
            .is_some()
    }

    fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.grants.len();
        self.grants.retain(|_, g| g.is_valid_at(now));
        before - self.grants.len()
    }
}

/// Persistent grant store backed by SQLite. Survives restarts.
pub struct SqliteGrantStore {
    conn: Mutex<rusqlite::Connection>,
    clock: Arc<dyn Clock>,
}

impl SqliteGrantStore {
    /// Open (or create) the grant table in the database at `path`.
    pub fn open(path: &str, clock: Arc<dyn Clock>) -> Result<Self, X402Error> {
        let conn = open_sqlite(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS access_grants (
                subject_id TEXT NOT NULL,
                resource_id TEXT NOT NULL,
                granted_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                PRIMARY KEY (subject_id, resource_id)
            );
            CREATE INDEX IF NOT EXISTS idx_grants_expires_at ON access_grants(expires_at);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            clock,
        })
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl GrantStore for SqliteGrantStore {
    fn has_valid_grant(&self, subject_id: &str, resource_id: &str) -> bool {
        let conn = lock(&self.conn);
        let now = self.clock.now().timestamp_millis();
        if let Err(e) = conn.execute(
            "DELETE FROM access_grants WHERE subject_id = ?1 AND resource_id = ?2 AND expires_at <= ?3",
            rusqlite::params![subject_id, resource_id, now],
        ) {
            tracing::warn!(error = %e, "failed to evict expired grant");
        }
        // Fail closed: a database error means no access.
        conn.query_row(
            "SELECT COUNT(*) FROM access_grants WHERE subject_id = ?1 AND resource_id = ?2 AND expires_at > ?3",
            rusqlite::params![subject_id, resource_id, now],
            |row| row.get::<_, i64>(0),
        )
        .map(|count| count > 0)
        .unwrap_or(false)
    }

    fn grant(
        &self,
        subject_id: &str,
        resource_id: &str,
        ttl: Duration,
    ) -> Result<AccessGrant, X402Error> {
        let conn = lock(&self.conn);
        let now = self.clock.now();
        let now_ms = now.timestamp_millis();
        let expires_ms = (now + to_chrono(ttl)).timestamp_millis();

        // Single statement: upsert keeps the later expiry, and restarts the
        // grant if the stored one had already lapsed.
        conn.execute(
            "INSERT INTO access_grants (subject_id, resource_id, granted_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(subject_id, resource_id) DO UPDATE SET
                granted_at = CASE WHEN access_grants.expires_at <= ?3 THEN ?3 ELSE access_grants.granted_at END,
                expires_at = CASE WHEN access_grants.expires_at <= ?3 THEN ?4
                                  ELSE MAX(access_grants.expires_at, ?4) END",
            rusqlite::params![subject_id, resource_id, now_ms, expires_ms],
        )?;

        let (granted_at, expires_at) = conn.query_row(
            "SELECT granted_at, expires_at FROM access_grants WHERE subject_id = ?1 AND resource_id = ?2",
            rusqlite::params![subject_id, resource_id],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )?;

        Ok(AccessGrant {
            subject_id: subject_id.to_string(),
            resource_id: resource_id.to_string(),
            granted_at: from_millis(granted_at),
            expires_at: from_millis(expires_at),
        })
    }

    fn revoke(&self, subject_id: &str, resource_id: &str) -> bool {
        let conn = lock(&self.conn);
        match conn.execute(
            "DELETE FROM access_grants WHERE subject_id = ?1 AND resource_id = ?2",
            rusqlite::params![subject_id, resource_id],
        ) {
            Ok(n) => n > 0,
            Err(e) => {
                tracing::error!(error = %e, "failed to revoke grant");
                false
            }
        }
    }

    fn purge_expired(&self) -> usize {
        let conn = lock(&self.conn);
        let now = self.clock.now().timestamp_millis();
        conn.execute(
            "DELETE FROM access_grants WHERE expires_at <= ?1",
            rusqlite::params![now],
        )
        .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const TTL: Duration = Duration::from_secs(3600);

    fn sqlite(dir: &tempfile::TempDir, clock: Arc<ManualClock>) -> SqliteGrantStore {
        let path = dir.path().join("grants.db");
        SqliteGrantStore::open(path.to_str().unwrap(), clock).unwrap()
    }

    fn assert_expiry_boundary(store: &dyn GrantStore, clock: &ManualClock) {
        store.grant("alice", "/a", TTL).unwrap();
        clock.advance(chrono::Duration::seconds(3599));
        assert!(store.has_valid_grant("alice", "/a"));
        clock.advance(chrono::Duration::seconds(2));
        assert!(!store.has_valid_grant("alice", "/a"));
    }

    #[test]
    fn test_in_memory_expiry_boundary() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = InMemoryGrantStore::new(clock.clone());
        assert_expiry_boundary(&store, &clock);
        assert!(store.is_empty(), "expired grant should be evicted on read");
    }

    #[test]
    fn test_sqlite_expiry_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let store = sqlite(&dir, clock.clone());
        assert_expiry_boundary(&store, &clock);
    }

    #[test]
    fn test_in_memory_grant_never_shortens() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = InMemoryGrantStore::new(clock.clone());
        let long = store.grant("alice", "/a", TTL).unwrap();
        let short = store.grant("alice", "/a", Duration::from_secs(60)).unwrap();
        assert_eq!(short.expires_at, long.expires_at);
        assert_eq!(short.granted_at, long.granted_at);
    }

    #[test]
    fn test_sqlite_grant_never_shortens() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let store = sqlite(&dir, clock.clone());
        let long = store.grant("alice", "/a", TTL).unwrap();
        clock.advance(chrono::Duration::seconds(10));
        let refreshed = store.grant("alice", "/a", TTL).unwrap();
        assert_eq!(refreshed.granted_at, long.granted_at);
        assert_eq!(
            refreshed.expires_at - long.expires_at,
            chrono::Duration::seconds(10)
        );
        let short = store.grant("alice", "/a", Duration::from_secs(1)).unwrap();
        assert_eq!(short.expires_at, refreshed.expires_at);
    }

    #[test]
    fn test_lapsed_grant_restarts() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = InMemoryGrantStore::new(clock.clone());
        let first = store.grant("alice", "/a", Duration::from_secs(10)).unwrap();
        clock.advance(chrono::Duration::seconds(20));
        let second = store.grant("alice", "/a", Duration::from_secs(10)).unwrap();
        assert!(second.granted_at > first.granted_at);
        assert!(store.has_valid_grant("alice", "/a"));
    }

    #[test]
    fn test_grants_are_per_subject_and_resource() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = InMemoryGrantStore::new(clock);
        store.grant("alice", "/a", TTL).unwrap();
        assert!(store.has_valid_grant("alice", "/a"));
        assert!(!store.has_valid_grant("bob", "/a"));
        assert!(!store.has_valid_grant("alice", "/b"));
    }

    #[test]
    fn test_revoke() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let stores: Vec<Box<dyn GrantStore>> = vec![
            Box::new(InMemoryGrantStore::new(clock.clone())),
            Box::new(sqlite(&dir, clock)),
        ];
        for store in stores {
            store.grant("alice", "/a", TTL).unwrap();
            assert!(store.revoke("alice", "/a"));
            assert!(!store.has_valid_grant("alice", "/a"));
            assert!(!store.revoke("alice", "/a"));
        }
    }

    #[test]
    fn test_sqlite_persists() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        {
            let store = sqlite(&dir, clock.clone());
            store.grant("alice", "/a", TTL).unwrap();
        }
        let store = sqlite(&dir, clock);
        assert!(store.has_valid_grant("alice", "/a"));
    }

    #[test]
    fn test_purge_expired() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = InMemoryGrantStore::new(clock.clone());
        store.grant("alice", "/a", Duration::from_secs(10)).unwrap();
        store.grant("bob", "/a", TTL).unwrap();
        clock.advance(chrono::Duration::seconds(11));
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }
}
