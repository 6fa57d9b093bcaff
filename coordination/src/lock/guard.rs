//! Scoped lock ownership

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use crate::store::SharedStore;

/// Names of the locks this instance holds, mapped to their holder tokens.
pub(crate) type HeldLocks = Arc<Mutex<HashMap<String, String>>>;

/// How the lock is held
#[derive(Debug)]
pub(crate) enum Holding {
    /// Cluster-wide: a key in the backing store carrying our token
    Store { key: String, token: String },
    /// Degraded: an in-process mutex, exclusive within this instance only
    Local(OwnedMutexGuard<()>),
}

/// Proof of lock ownership.
///
/// Call [`LockGuard::release`] when the critical section ends. A guard that
/// is dropped without being released (panic, cancelled task, early return)
/// schedules the release on the current tokio runtime; outside a runtime
/// the key is left to expire by its TTL.
#[must_use = "dropping the guard immediately releases the lock"]
pub struct LockGuard {
    name: String,
    holding: Option<Holding>,
    store: SharedStore,
    held: HeldLocks,
}

impl LockGuard {
    pub(crate) fn new(name: String, holding: Holding, store: SharedStore, held: HeldLocks) -> Self {
        if let Holding::Store { token, .. } = &holding {
            if let Ok(mut held) = held.lock() {
                held.insert(name.clone(), token.clone());
            }
        }
        Self {
            name,
            holding: Some(holding),
            store,
            held,
        }
    }

    /// Lock name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Holder token, if held through the backing store
    pub fn token(&self) -> Option<&str> {
        match &self.holding {
            Some(Holding::Store { token, .. }) => Some(token),
            _ => None,
        }
    }

    /// Whether exclusion is only guaranteed within this instance
    pub fn is_local(&self) -> bool {
        matches!(self.holding, Some(Holding::Local(_)))
    }

    /// Release the lock. Returns `false` if the lock had already been taken
    /// over by another holder (our TTL lapsed) or the store refused.
    pub async fn release(mut self) -> bool {
        match self.holding.take() {
            Some(Holding::Store { key, token }) => {
                self.forget(&token);
                release_key(&self.store, &self.name, &key, &token).await
            }
            Some(Holding::Local(guard)) => {
                drop(guard);
                debug!(lock = %self.name, "Local lock released");
                true
            }
            None => true,
        }
    }

    /// Drop our entry from the held map, unless a newer guard for the same
    /// name has replaced it.
    fn forget(&self, token: &str) {
        if let Ok(mut held) = self.held.lock() {
            if held.get(&self.name).is_some_and(|t| t == token) {
                held.remove(&self.name);
            }
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .field("holding", &self.holding)
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(Holding::Store { key, token }) = self.holding.take() else {
            return;
        };
        self.forget(&token);
        match Handle::try_current() {
            Ok(handle) => {
                let store = Arc::clone(&self.store);
                let name = std::mem::take(&mut self.name);
                handle.spawn(async move {
                    release_key(&store, &name, &key, &token).await;
                });
            }
            Err(_) => {
                warn!(lock = %self.name, "Lock guard dropped outside a runtime; key will expire by TTL");
            }
        }
    }
}

/// Compare-and-delete against the store. Never raises.
pub(crate) async fn release_key(store: &SharedStore, name: &str, key: &str, token: &str) -> bool {
    match store.compare_and_delete(key, token).await {
        Ok(true) => {
            debug!(lock = name, "Lock released");
            true
        }
        Ok(false) => match store.exists(key).await {
            Ok(false) => {
                debug!(lock = name, "Lock already expired at release");
                true
            }
            _ => {
                warn!(lock = name, "Release refused: lock is held by another token");
                false
            }
        },
        Err(e) => {
            warn!(lock = name, error = %e, "Lock release failed; key will expire by TTL");
            false
        }
    }
}
