//! Cluster-wide mutual exclusion
//!
//! A lock is a key in the shared backing store whose value is a random
//! holder token. Acquisition is a set-if-absent with expiry, retried at a
//! fixed delay; release is a compare-and-delete on the token, so a holder
//! whose TTL lapsed can never delete a lock that someone else now holds.
//!
//! When the backing store cannot be reached, acquisition falls back to a
//! per-name in-process mutex and logs a warning. In that mode exclusion
//! only holds between tasks of this instance.

mod guard;

pub use guard::LockGuard;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::{KeySpace, KeyTtl, SharedStore};
use guard::{release_key, HeldLocks, Holding};

/// Error type for lock acquisition
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("Timed out acquiring lock '{name}' after {attempts} attempts")]
    Timeout { name: String, attempts: u32 },

    #[error("Acquisition of lock '{name}' was cancelled")]
    Cancelled { name: String },
}

/// Result type for lock operations
pub type LockResult<T> = Result<T, LockError>;

/// Shared reference to DistributedLock
pub type SharedLock = Arc<DistributedLock>;

/// Acquisition parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireOptions {
    /// Lock TTL; the lock frees itself after this long
    pub timeout: Duration,
    /// Delay between attempts
    pub retry_delay: Duration,
    /// Attempts before giving up
    pub max_retries: u32,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retry_delay: Duration::from_millis(100),
            max_retries: 100,
        }
    }
}

impl AcquireOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Upper bound on how long acquisition may wait
    pub fn wait_budget(&self) -> Duration {
        self.retry_delay.saturating_mul(self.max_retries)
    }
}

/// A lock visible in the backing store
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct LockInfo {
    pub name: String,
    /// Remaining lifetime; `None` for a key without expiry
    pub ttl: Option<Duration>,
}

/// Distributed lock manager
pub struct DistributedLock {
    store: SharedStore,
    keys: KeySpace,
    defaults: AcquireOptions,
    local: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    held: HeldLocks,
}

impl DistributedLock {
    /// Create a lock manager over a backing store
    pub fn new(store: SharedStore, keys: KeySpace) -> Self {
        Self {
            store,
            keys,
            defaults: AcquireOptions::default(),
            local: Mutex::new(HashMap::new()),
            held: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Override the options used by [`Self::acquire_default`]
    pub fn with_defaults(mut self, defaults: AcquireOptions) -> Self {
        self.defaults = defaults;
        self
    }

    /// Create a shared reference to this lock manager
    pub fn shared(self) -> SharedLock {
        Arc::new(self)
    }

    pub fn defaults(&self) -> AcquireOptions {
        self.defaults
    }

    /// Acquire with the configured default options
    pub async fn acquire_default(&self, name: &str) -> LockResult<LockGuard> {
        self.acquire(name, self.defaults).await
    }

    /// Acquire `name`, retrying until `opts.max_retries` attempts are spent
    pub async fn acquire(&self, name: &str, opts: AcquireOptions) -> LockResult<LockGuard> {
        self.acquire_with_cancel(name, opts, &CancellationToken::new())
            .await
    }

    /// Acquire `name`, giving up early when `cancel` fires
    pub async fn acquire_with_cancel(
        &self,
        name: &str,
        opts: AcquireOptions,
        cancel: &CancellationToken,
    ) -> LockResult<LockGuard> {
        let key = self.keys.lock(name);
        let token = Uuid::new_v4().to_string();
        let mut attempts = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(LockError::Cancelled { name: name.into() });
            }
            attempts += 1;

            match self.store.set_if_absent(&key, &token, opts.timeout).await {
                Ok(true) => {
                    debug!(lock = name, attempts, "Lock acquired");
                    return Ok(LockGuard::new(
                        name.to_string(),
                        Holding::Store { key, token },
                        Arc::clone(&self.store),
                        Arc::clone(&self.held),
                    ));
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        lock = name,
                        error = %e,
                        "Backing store unreachable; falling back to instance-local lock"
                    );
                    return self.acquire_local(name, opts, cancel).await;
                }
            }

            if attempts >= opts.max_retries {
                warn!(lock = name, attempts, "Lock acquisition timed out");
                return Err(LockError::Timeout {
                    name: name.into(),
                    attempts,
                });
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(LockError::Cancelled { name: name.into() });
                }
                _ = tokio::time::sleep(opts.retry_delay) => {}
            }
        }
    }

    async fn acquire_local(
        &self,
        name: &str,
        opts: AcquireOptions,
        cancel: &CancellationToken,
    ) -> LockResult<LockGuard> {
        let mutex = self.local_mutex(name);
        tokio::select! {
            _ = cancel.cancelled() => Err(LockError::Cancelled { name: name.into() }),
            res = tokio::time::timeout(opts.wait_budget(), mutex.lock_owned()) => match res {
                Ok(guard) => {
                    debug!(lock = name, "Local lock acquired");
                    Ok(LockGuard::new(
                        name.to_string(),
                        Holding::Local(guard),
                        Arc::clone(&self.store),
                        Arc::clone(&self.held),
                    ))
                }
                Err(_) => {
                    warn!(lock = name, "Local lock acquisition timed out");
                    Err(LockError::Timeout {
                        name: name.into(),
                        attempts: opts.max_retries,
                    })
                }
            },
        }
    }

    fn local_mutex(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut local = match self.local.lock() {
            Ok(local) => local,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(local.entry(name.to_string()).or_default())
    }

    /// Run `f` while holding `name`. The lock is released on every exit
    /// path, including an error returned by `f`.
    pub async fn with_lock<F, Fut, T>(
        &self,
        name: &str,
        opts: AcquireOptions,
        f: F,
    ) -> LockResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.acquire(name, opts).await?;
        let out = f().await;
        guard.release().await;
        Ok(out)
    }

    /// Release `name` if `token` still owns it.
    ///
    /// A mismatched token is refused with a warning rather than an error,
    /// so shutdown paths can call this unconditionally.
    pub async fn release(&self, name: &str, token: &str) -> bool {
        let key = self.keys.lock(name);
        let released = release_key(&self.store, name, &key, token).await;
        if released {
            if let Ok(mut held) = self.held.lock() {
                if held.get(name).is_some_and(|t| t == token) {
                    held.remove(name);
                }
            }
        }
        released
    }

    /// Whether anyone holds `name`
    pub async fn is_locked(&self, name: &str) -> bool {
        match self.store.exists(&self.keys.lock(name)).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(lock = name, error = %e, "Cannot query lock; checking local lock only");
                self.local
                    .lock()
                    .ok()
                    .and_then(|local| local.get(name).map(|m| m.try_lock().is_err()))
                    .unwrap_or(false)
            }
        }
    }

    /// Delete `name` regardless of holder. Admin escape hatch for deadlocks.
    pub async fn force_release(&self, name: &str) -> bool {
        match self.store.delete(&self.keys.lock(name)).await {
            Ok(removed) => {
                warn!(lock = name, removed, "Lock force-released");
                if let Ok(mut held) = self.held.lock() {
                    held.remove(name);
                }
                removed
            }
            Err(e) => {
                warn!(lock = name, error = %e, "Force release failed");
                false
            }
        }
    }

    /// Locks currently present in the store with their remaining TTL
    pub async fn active_locks(&self) -> Vec<LockInfo> {
        let keys = match self.store.scan(&self.keys.lock_prefix()).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Cannot enumerate locks");
                return Vec::new();
            }
        };

        let lookups = keys.iter().filter_map(|key| {
            let name = self.keys.parse_lock_name(key)?;
            Some(async move { (name, self.store.ttl(key).await) })
        });

        let mut locks = Vec::with_capacity(keys.len());
        for (name, ttl) in join_all(lookups).await {
            match ttl {
                Ok(KeyTtl::Missing) => {}
                Ok(ttl) => locks.push(LockInfo {
                    name: name.to_string(),
                    ttl: ttl.remaining(),
                }),
                Err(e) => warn!(lock = name, error = %e, "Cannot read lock TTL"),
            }
        }
        locks
    }

    /// Remove lock keys that carry no expiry. Returns how many were removed.
    ///
    /// Every lock this crate writes has a TTL, so a persistent lock key was
    /// left behind by a broken writer and would block its name forever.
    pub async fn cleanup_expired_locks(&self) -> usize {
        let mut removed = 0;
        for lock in self.active_locks().await {
            if lock.ttl.is_none() && self.force_release(&lock.name).await {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "Cleaned up stale locks");
        }
        removed
    }

    /// Names of the store-backed locks held through this manager
    pub fn held_locks(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .held
            .lock()
            .map(|held| held.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Release every lock still held through this manager
    pub async fn release_all(&self) -> usize {
        let held: Vec<(String, String)> = self
            .held
            .lock()
            .map(|held| held.iter().map(|(n, t)| (n.clone(), t.clone())).collect())
            .unwrap_or_default();
        let mut released = 0;
        for (name, token) in held {
            if self.release(&name, &token).await {
                released += 1;
            }
        }
        released
    }
}
