//! Cluster-wide session continuity
//!
//! Sessions are JSON documents in the shared backing store, keyed by id,
//! with sliding expiration: every successful read or update resets the
//! remaining lifetime to the configured default TTL.
//!
//! Read-modify-write paths (`get`, `update`) go through compare-and-swap
//! and retry a bounded number of times on a concurrent write.
//!
//! Nothing here raises. An unreachable store turns every operation into a
//! `false`/`None` result plus a warning; [`SessionManager::lookup`] and
//! [`SessionManager::is_authorized`] let callers tell an outage apart from
//! a missing session.

pub mod types;

pub use types::{CleanupReport, Session, SessionLookup, StoreFailurePolicy};

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::store::{KeySpace, KeyTtl, SharedStore};

/// Default sliding TTL
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(3600);

/// Compare-and-swap attempts for read-modify-write paths
const DEFAULT_WRITE_RETRIES: u32 = 5;

/// Shared reference to SessionManager
pub type SharedSessionManager = Arc<SessionManager>;

/// Session store over the shared backing store
pub struct SessionManager {
    store: SharedStore,
    keys: KeySpace,
    default_ttl: Duration,
    write_retries: u32,
}

impl SessionManager {
    pub fn new(store: SharedStore, keys: KeySpace) -> Self {
        Self {
            store,
            keys,
            default_ttl: DEFAULT_SESSION_TTL,
            write_retries: DEFAULT_WRITE_RETRIES,
        }
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_write_retries(mut self, retries: u32) -> Self {
        self.write_retries = retries.max(1);
        self
    }

    /// Create a shared reference to this session manager
    pub fn shared(self) -> SharedSessionManager {
        Arc::new(self)
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Store a session. Creating an existing id overwrites it.
    pub async fn create(
        &self,
        session_id: &str,
        payload: Map<String, Value>,
        ttl: Option<Duration>,
    ) -> bool {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let session = Session::new(session_id, payload, ttl.as_secs());
        let Some(body) = encode(&session) else {
            return false;
        };
        match self
            .store
            .set_with_ttl(&self.keys.session(session_id), &body, ttl)
            .await
        {
            Ok(()) => {
                debug!(session_id, ttl_secs = ttl.as_secs(), "Session created");
                true
            }
            Err(e) => {
                warn!(session_id, error = %e, "Session create failed");
                false
            }
        }
    }

    /// Read a session, resetting its TTL to the default
    pub async fn get(&self, session_id: &str) -> Option<Session> {
        self.lookup(session_id).await.into_session()
    }

    /// Read a session, distinguishing a miss from an unreachable store.
    /// A hit resets the TTL to the default.
    pub async fn lookup(&self, session_id: &str) -> SessionLookup {
        let key = self.keys.session(session_id);
        let mut last_seen = None;

        for _ in 0..self.write_retries {
            let (raw, mut session) = match self.read(&key, session_id).await {
                Ok(Some(found)) => found,
                Ok(None) => return SessionLookup::Missing,
                Err(()) => return SessionLookup::Unavailable,
            };
            session.touch(self.default_ttl.as_secs());
            let Some(body) = encode(&session) else {
                return SessionLookup::Found(session);
            };

            match self
                .store
                .compare_and_swap(&key, &raw, &body, self.default_ttl)
                .await
            {
                Ok(true) => return SessionLookup::Found(session),
                Ok(false) => {
                    debug!(session_id, "Session changed during read; retrying");
                    last_seen = Some(session);
                }
                Err(e) => {
                    warn!(session_id, error = %e, "Session TTL refresh failed");
                    return SessionLookup::Unavailable;
                }
            }
        }

        warn!(session_id, "Session TTL not refreshed after repeated write conflicts");
        last_seen.map_or(SessionLookup::Missing, SessionLookup::Found)
    }

    /// Shallow-merge `partial` into an existing session. Never creates one.
    pub async fn update(&self, session_id: &str, partial: Map<String, Value>) -> bool {
        let key = self.keys.session(session_id);

        for _ in 0..self.write_retries {
            let (raw, mut session) = match self.read(&key, session_id).await {
                Ok(Some(found)) => found,
                Ok(None) => {
                    warn!(session_id, "Session not found for update");
                    return false;
                }
                Err(()) => return false,
            };
            session.merge(partial.clone());
            session.touch(self.default_ttl.as_secs());
            let Some(body) = encode(&session) else {
                return false;
            };

            match self
                .store
                .compare_and_swap(&key, &raw, &body, self.default_ttl)
                .await
            {
                Ok(true) => {
                    debug!(session_id, "Session updated");
                    return true;
                }
                Ok(false) => debug!(session_id, "Session changed during update; retrying"),
                Err(e) => {
                    warn!(session_id, error = %e, "Session update failed");
                    return false;
                }
            }
        }

        warn!(session_id, "Session update abandoned after repeated write conflicts");
        false
    }

    /// Add `by` to the session's remaining TTL. Fails when it is absent.
    pub async fn extend(&self, session_id: &str, by: Duration) -> bool {
        match self
            .store
            .extend_ttl(&self.keys.session(session_id), by)
            .await
        {
            Ok(Some(ttl)) => {
                debug!(session_id, ttl_secs = ttl.as_secs(), "Session extended");
                true
            }
            Ok(None) => {
                debug!(session_id, "Cannot extend missing session");
                false
            }
            Err(e) => {
                warn!(session_id, error = %e, "Session extend failed");
                false
            }
        }
    }

    /// Remove a session. Returns `true` if one was removed.
    pub async fn delete(&self, session_id: &str) -> bool {
        match self.store.delete(&self.keys.session(session_id)).await {
            Ok(removed) => {
                debug!(session_id, removed, "Session deleted");
                removed
            }
            Err(e) => {
                warn!(session_id, error = %e, "Session delete failed");
                false
            }
        }
    }

    /// Remaining TTL of a session, without refreshing it
    pub async fn remaining_ttl(&self, session_id: &str) -> Option<Duration> {
        match self.store.ttl(&self.keys.session(session_id)).await {
            Ok(ttl) => ttl.remaining(),
            Err(e) => {
                warn!(session_id, error = %e, "Session TTL query failed");
                None
            }
        }
    }

    /// Number of live sessions (best effort)
    pub async fn count(&self) -> usize {
        match self.store.scan(&self.keys.session_prefix()).await {
            Ok(keys) => keys.len(),
            Err(e) => {
                warn!(error = %e, "Session count failed");
                0
            }
        }
    }

    /// Sweep the session keyspace. Expired entries are purged from stores
    /// that expire lazily, then keys without expiry and unreadable bodies
    /// are removed.
    pub async fn cleanup(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        match self.store.purge_expired().await {
            Ok(purged) => report.purged = purged,
            Err(e) => warn!(error = %e, "Expired entry purge failed"),
        }
        let keys = match self.store.scan(&self.keys.session_prefix()).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Session cleanup skipped");
                return report;
            }
        };
        report.scanned = keys.len();

        for key in keys {
            let session_id = self.keys.parse_session_id(&key).unwrap_or(key.as_str());
            let orphan = match self.store.ttl(&key).await {
                Ok(KeyTtl::Missing) => {
                    report.expired += 1;
                    continue;
                }
                Ok(KeyTtl::Persistent) => true,
                Ok(KeyTtl::Expires(_)) => match self.store.get(&key).await {
                    Ok(Some(raw)) => serde_json::from_str::<Session>(&raw).is_err(),
                    Ok(None) => {
                        report.expired += 1;
                        continue;
                    }
                    Err(_) => false,
                },
                Err(e) => {
                    warn!(session_id, error = %e, "Session TTL query failed during cleanup");
                    continue;
                }
            };
            if orphan && matches!(self.store.delete(&key).await, Ok(true)) {
                debug!(session_id, "Orphaned session removed");
                report.orphans_removed += 1;
            }
        }

        if report.expired > 0 || report.orphans_removed > 0 || report.purged > 0 {
            info!(
                scanned = report.scanned,
                expired = report.expired,
                orphans_removed = report.orphans_removed,
                purged = report.purged,
                "Session cleanup finished"
            );
        }
        report
    }

    /// Whether `session_id` grants access. An unreachable store resolves
    /// according to `policy`.
    pub async fn is_authorized(&self, session_id: &str, policy: StoreFailurePolicy) -> bool {
        match self.lookup(session_id).await {
            SessionLookup::Found(_) => true,
            SessionLookup::Missing => false,
            SessionLookup::Unavailable => {
                let allowed = policy == StoreFailurePolicy::FailOpen;
                warn!(session_id, ?policy, allowed, "Session store unavailable during authorization");
                allowed
            }
        }
    }

    /// Fetch and decode. `Err(())` means the store could not be reached
    /// (already logged). An undecodable body reads as missing.
    async fn read(&self, key: &str, session_id: &str) -> Result<Option<(String, Session)>, ()> {
        let raw = match self.store.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!(session_id, error = %e, "Session read failed");
                return Err(());
            }
        };
        match serde_json::from_str::<Session>(&raw) {
            Ok(session) => Ok(Some((raw, session))),
            Err(e) => {
                warn!(session_id, error = %e, "Discarding undecodable session");
                Ok(None)
            }
        }
    }
}

fn encode(session: &Session) -> Option<String> {
    match serde_json::to_string(session) {
        Ok(body) => Some(body),
        Err(e) => {
            warn!(session_id = %session.session_id, error = %e, "Session encode failed");
            None
        }
    }
}
