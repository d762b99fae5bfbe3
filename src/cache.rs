//! Redis read-through cache
//!
//! Caches cluster and stack read models so list/get endpoints avoid
//! hitting the store on every call. Every operation degrades to a miss
//! on connection trouble; the store remains the source of truth. The
//! event consumer invalidates entries as lifecycle events commit.

use std::sync::Arc;

use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::CacheConfiguration;

/// Read-through cache over Redis.
pub struct Cache {
    /// Redis connection manager
    connection: Arc<RwLock<Option<ConnectionManager>>>,

    /// Key prefix
    prefix: String,

    /// TTL applied to cached entries in seconds
    ttl_seconds: u64,

    /// Whether caching is enabled at all
    enabled: bool,
}

impl Cache {
    /// Create a cache (not yet connected)
    pub fn new(config: &CacheConfiguration) -> Self {
        Self {
            connection: Arc::new(RwLock::new(None)),
            prefix: "stackd".to_string(),
            ttl_seconds: config.ttl_seconds,
            enabled: config.enabled,
        }
    }

    /// Disabled cache for tests and cache-less deployments
    pub fn disabled() -> Self {
        Self {
            connection: Arc::new(RwLock::new(None)),
            prefix: "stackd".to_string(),
            ttl_seconds: 0,
            enabled: false,
        }
    }

    /// Connect to Redis
    pub async fn connect(&self, url: &str) -> Result<(), redis::RedisError> {
        if !self.enabled {
            debug!("cache disabled, skipping Redis connection");
            return Ok(());
        }

        info!("Connecting cache to {}", url);
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        *self.connection.write() = Some(connection);
        info!("Cache connected");
        Ok(())
    }

    fn get_connection(&self) -> Option<ConnectionManager> {
        if !self.enabled {
            return None;
        }
        self.connection.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.enabled && self.connection.read().is_some()
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    /// Fetch a cached read model; None on miss, error or disabled cache
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut conn = self.get_connection()?;

        let result: Result<Option<String>, redis::RedisError> =
            conn.get(self.full_key(key)).await;

        match result {
            Ok(Some(value)) => match serde_json::from_str(&value) {
                Ok(parsed) => Some(parsed),
                Err(e) => {
                    warn!(key, "failed to decode cached value: {}", e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(key, "cache read failed: {}", e);
                None
            }
        }
    }

    /// Store a read model under the configured TTL
    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T) {
        let Some(mut conn) = self.get_connection() else {
            return;
        };

        let encoded = match serde_json::to_string(value) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(key, "failed to encode value for cache: {}", e);
                return;
            }
        };

        let result: Result<(), redis::RedisError> = conn
            .set_ex(self.full_key(key), encoded, self.ttl_seconds)
            .await;
        if let Err(e) = result {
            warn!(key, "cache write failed: {}", e);
        }
    }

    /// Drop a single entry. Deleting an absent key is a no-op, which is
    /// what makes consumer replays idempotent.
    pub async fn invalidate(&self, key: &str) {
        let Some(mut conn) = self.get_connection() else {
            return;
        };

        let result: Result<(), redis::RedisError> = conn.del(self.full_key(key)).await;
        match result {
            Ok(()) => debug!(key, "cache invalidated"),
            Err(e) => warn!(key, "cache invalidation failed: {}", e),
        }
    }

    /// Drop several entries
    pub async fn invalidate_many(&self, keys: &[String]) {
        for key in keys {
            self.invalidate(key).await;
        }
    }
}

impl Clone for Cache {
    fn clone(&self) -> Self {
        Self {
            connection: self.connection.clone(),
            prefix: self.prefix.clone(),
            ttl_seconds: self.ttl_seconds,
            enabled: self.enabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_cache_is_inert() {
        let cache = Cache::disabled();

        cache.put_json("stack:1", &serde_json::json!({"id": "1"})).await;
        let got: Option<serde_json::Value> = cache.get_json("stack:1").await;
        assert!(got.is_none());
        assert!(!cache.is_connected());

        // Invalidation on a disabled cache must not panic
        cache.invalidate("stack:1").await;
    }
}
