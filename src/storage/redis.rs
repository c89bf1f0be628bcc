// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis backend for the hot cache.
//!
//! Records are stored as plain JSON strings with `SET key value EX ttl`:
//!
//! ```text
//! SET catalog:us|work|B08G9PRS1K '{"asin":"B08G9PRS1K","region":"us",...}' EX 86400
//! ```
//!
//! Every command goes through the query retry preset, so a dropped connection
//! is re-established by the `ConnectionManager` before the caller sees an error.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::time::Duration;

use super::traits::{CacheStore, StorageError};
use crate::resilience::retry::{retry, RetryConfig};

pub struct RedisCache {
    connection: ConnectionManager,
    /// Optional key prefix for namespacing (e.g., "catalog:" → "catalog:us|work|B08G9PRS1K")
    prefix: String,
}

impl RedisCache {
    /// Connect without a key prefix.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_prefix(connection_string, None).await
    }

    /// Connect with an optional key prefix.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use catalog_sync::storage::redis::RedisCache;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let cache = RedisCache::with_prefix("redis://localhost", Some("catalog:")).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_prefix(connection_string: &str, prefix: Option<&str>) -> Result<Self, StorageError> {
        let client = Client::open(connection_string).map_err(|e| StorageError::Backend(e.to_string()))?;

        let connection = retry("redis_connect", &RetryConfig::connect(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))?;

        Ok(Self {
            connection,
            prefix: prefix.unwrap_or("").to_string(),
        })
    }

    fn namespaced(&self, key: &str) -> String {
        [self.prefix.as_str(), key].concat()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

/// Redis expiries are whole seconds, and zero is rejected.
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.connection.clone();
        let key = self.namespaced(key);

        retry("redis_get", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let value: Option<String> = conn.get(&key).await?;
                Ok(value)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        let key = self.namespaced(key);
        let secs = ttl_secs(ttl);

        retry("redis_set", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            let value = value.to_string();
            async move {
                let _: () = conn.set_ex(&key, value, secs).await?;
                Ok(())
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let conn = self.connection.clone();
        let key = self.namespaced(key);

        retry("redis_delete", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let removed: usize = conn.del(&key).await?;
                Ok(removed > 0)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StorageError> {
        let conn = self.connection.clone();
        let key = self.namespaced(key);
        let secs = ttl_secs(ttl) as i64;

        retry("redis_expire", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let applied: bool = conn.expire(&key, secs).await?;
                Ok(applied)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_rounds_down_but_never_zero() {
        assert_eq!(ttl_secs(Duration::from_secs(86_400)), 86_400);
        assert_eq!(ttl_secs(Duration::from_millis(1500)), 1);
        assert_eq!(ttl_secs(Duration::ZERO), 1);
    }
}
