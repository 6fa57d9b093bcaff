//! Backing store contract
//!
//! The only cross-instance shared mutable resource. Every interaction goes
//! through the atomic primitives below; callers never compose a plain
//! `get` followed by a `set`/`delete` against a shared key.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

/// Error type for backing store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Backing store unavailable: {0}")]
    Unavailable(String),

    #[error("Backing store error: {0}")]
    Backend(String),

    /// A reply could not be converted to the expected type
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether the failure means the store could not be reached at all.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Result type for backing store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Shared reference to a backing store
pub type SharedStore = Arc<dyn BackingStore>;

/// Remaining lifetime of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// Key does not exist (or has already expired)
    Missing,
    /// Key exists without an expiry
    Persistent,
    /// Key expires after the given duration
    Expires(Duration),
}

impl KeyTtl {
    /// Remaining duration, if the key exists and expires.
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            Self::Expires(d) => Some(*d),
            _ => None,
        }
    }
}

/// Key/value storage with per-key TTL and atomic scripted primitives.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Round-trip check.
    async fn ping(&self) -> StoreResult<()>;

    /// Atomically set `key` to `value` with `ttl` only if the key is absent.
    /// Returns `true` when the value was written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Atomically delete `key` only if its current value equals `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool>;

    /// Atomically replace the value of `key` with `new` (and reset its TTL)
    /// only if the current value equals `expected`.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new: &str,
        ttl: Duration,
    ) -> StoreResult<bool>;

    /// Atomically add `by` to the remaining TTL of an expiring key.
    /// Returns the new TTL, or `None` if the key is missing or has no expiry.
    async fn extend_ttl(&self, key: &str, by: Duration) -> StoreResult<Option<Duration>>;

    /// Read a value.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Unconditionally write a value with a TTL.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Delete a key. Returns `true` if something was removed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Whether a key exists.
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Set the TTL of an existing key. Returns `false` if the key is missing.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Remaining TTL of a key.
    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl>;

    /// Enumerate keys starting with `prefix`.
    async fn scan(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Reclaim expired entries the store does not drop on its own.
    /// Returns how many were removed; stores with native expiry keep the
    /// default and report 0.
    async fn purge_expired(&self) -> StoreResult<usize> {
        Ok(0)
    }
}
