//! In-process backing store
//!
//! Implements the full [`BackingStore`] contract over a mutex-guarded map.
//! Expiry is evaluated against `tokio::time::Instant`, so tests running
//! with a paused clock can advance through TTLs deterministically.
//! Expired entries are dropped when their key is next touched or by
//! `purge_expired`, which session cleanup runs on every maintenance pass.
//!
//! Several lock/session managers holding the same `Arc<MemoryStore>`
//! behave like several service instances sharing one cluster store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use super::backend::{BackingStore, KeyTtl, StoreError, StoreResult};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Mutex-guarded in-memory store with per-key expiry
#[derive(Debug)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    available: AtomicBool,
}

impl MemoryStore {
    /// Create an empty, reachable store
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Simulate the store becoming (un)reachable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Whether the store currently answers requests
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .map(|entries| entries.values().filter(|e| e.is_live(now)).count())
            .unwrap_or(0)
    }

    /// Whether the store holds no live entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check reachability and lock the map.
    fn guard(&self) -> StoreResult<MutexGuard<'_, HashMap<String, Entry>>> {
        if !self.is_available() {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        self.entries
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }

    fn live<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
        now: Instant,
    ) -> Option<&'a mut Entry> {
        if entries.get(key).is_some_and(|e| !e.is_live(now)) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackingStore for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        self.guard().map(|_| ())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut entries = self.guard()?;
        let now = Instant::now();
        if Self::live(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut entries = self.guard()?;
        let now = Instant::now();
        let owned = Self::live(&mut entries, key, now).is_some_and(|e| e.value == expected);
        if owned {
            entries.remove(key);
        }
        Ok(owned)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut entries = self.guard()?;
        let now = Instant::now();
        match Self::live(&mut entries, key, now) {
            Some(entry) if entry.value == expected => {
                entry.value = new.to_string();
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn extend_ttl(&self, key: &str, by: Duration) -> StoreResult<Option<Duration>> {
        let mut entries = self.guard()?;
        let now = Instant::now();
        let Some(entry) = Self::live(&mut entries, key, now) else {
            return Ok(None);
        };
        let Some(at) = entry.expires_at else {
            return Ok(None);
        };
        let extended = at + by;
        entry.expires_at = Some(extended);
        Ok(Some(extended.saturating_duration_since(now)))
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut entries = self.guard()?;
        let now = Instant::now();
        Ok(Self::live(&mut entries, key, now).map(|e| e.value.clone()))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut entries = self.guard()?;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut entries = self.guard()?;
        let now = Instant::now();
        Ok(entries.remove(key).is_some_and(|e| e.is_live(now)))
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut entries = self.guard()?;
        let now = Instant::now();
        Ok(Self::live(&mut entries, key, now).is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut entries = self.guard()?;
        let now = Instant::now();
        match Self::live(&mut entries, key, now) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl> {
        let mut entries = self.guard()?;
        let now = Instant::now();
        Ok(match Self::live(&mut entries, key, now) {
            None => KeyTtl::Missing,
            Some(Entry {
                expires_at: None, ..
            }) => KeyTtl::Persistent,
            Some(Entry {
                expires_at: Some(at),
                ..
            }) => KeyTtl::Expires(at.saturating_duration_since(now)),
        })
    }

    async fn scan(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let entries = self.guard()?;
        let now = Instant::now();
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.is_live(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn purge_expired(&self) -> StoreResult<usize> {
        let mut entries = self.guard()?;
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "Purged expired entries");
        }
        Ok(removed)
    }
}

#[cfg(test)]
impl MemoryStore {
    /// Entries held in the map, expired or not
    pub(crate) fn raw_len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// Insert a key with no expiry (tests only; the hive never writes these).
    pub(crate) fn insert_persistent(&self, key: &str, value: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: None,
                },
            );
        }
    }
}
