//! Shared backing store for cluster-wide coordination
//!
//! Locks and sessions live in a key/value store that every instance of the
//! service can reach. Instances only hold references into it (a holder
//! token, a session id); losing an instance never destroys an entry, the
//! entry's TTL does.
//!
//! # Primitives
//!
//! | Primitive | Used by |
//! |---|---|
//! | `set_if_absent` (set-if-absent with expiry) | lock acquisition |
//! | `compare_and_delete` | lock release |
//! | `compare_and_swap` | session read/update with sliding TTL |
//! | `extend_ttl` | session extension |
//! | `get` / `set_with_ttl` / `delete` / `exists` / `expire` / `ttl` / `scan` | everything else |
//!
//! Two implementations ship: [`MemoryStore`] (single process, used in tests
//! and local development) and `RedisStore` behind the `redis-store` feature.

pub mod backend;
pub mod memory;
#[cfg(feature = "redis-store")]
pub mod redis_store;
pub mod schema;

pub use backend::{BackingStore, KeyTtl, SharedStore, StoreError, StoreResult};
pub use memory::MemoryStore;
#[cfg(feature = "redis-store")]
pub use redis_store::RedisStore;
pub use schema::KeySpace;

use tracing::info;

use crate::config::StoreConfig;

/// Open the store described by `config`: Redis when a URL is configured,
/// otherwise an in-process [`MemoryStore`].
pub async fn open(config: &StoreConfig) -> StoreResult<SharedStore> {
    match config.redis_url.as_deref() {
        #[cfg(feature = "redis-store")]
        Some(url) => {
            let store: SharedStore = std::sync::Arc::new(RedisStore::connect(url).await?);
            info!(namespace = %config.namespace, "Using Redis backing store");
            Ok(store)
        }
        #[cfg(not(feature = "redis-store"))]
        Some(_) => Err(StoreError::Backend(
            "a Redis URL is configured but the redis-store feature is disabled".to_string(),
        )),
        None => {
            info!(
                namespace = %config.namespace,
                "Using in-process backing store; locks and sessions are local to this instance"
            );
            let store: SharedStore = MemoryStore::new().shared();
            Ok(store)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_defaults_to_memory() {
        let store = open(&StoreConfig::default()).await.unwrap();
        assert!(store.ping().await.is_ok());
    }

    #[cfg(not(feature = "redis-store"))]
    #[tokio::test]
    async fn test_open_rejects_redis_without_feature() {
        let config = StoreConfig {
            redis_url: Some("redis://127.0.0.1/".into()),
            ..StoreConfig::default()
        };
        assert!(open(&config).await.is_err());
    }
}
