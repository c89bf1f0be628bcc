// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Failure-tolerant cache tier.
//!
//! The cache is a derived view: losing it costs latency, never correctness.
//! So reads never fail (a broken backend or an undecodable value is a miss),
//! writes are best effort, and the only call that reports failure is
//! [`RecordCache::set_confirmed()`].
//!
//! A cache built with [`RecordCache::disabled()`] has no backend and turns
//! every call into a no-op.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::traits::{CacheStore, StorageError};
use crate::error::SyncError;

/// Default entry lifetime: one day.
pub const DEFAULT_TTL: Duration = Duration::from_secs(86_400);

#[derive(Clone)]
pub struct RecordCache {
    backend: Option<Arc<dyn CacheStore>>,
    ttl: Duration,
}

impl RecordCache {
    pub fn new(backend: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self {
            backend: Some(backend),
            ttl,
        }
    }

    /// No backend; reads miss, writes are dropped.
    pub fn disabled() -> Self {
        Self {
            backend: None,
            ttl: DEFAULT_TTL,
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached JSON for `key`, or `None` on miss, backend failure or bad JSON.
    pub async fn get(&self, key: &str) -> Option<Value> {
        let backend = self.backend.as_ref()?;
        match backend.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(key, error = %e, "Cached value is not valid JSON, treating as miss");
                    crate::metrics::record_cache_error("decode");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(key, error = %e, "Cache read failed, treating as miss");
                crate::metrics::record_cache_error("get");
                None
            }
        }
    }

    /// Best-effort write with the default TTL.
    pub async fn set<R: Serialize + ?Sized>(&self, key: &str, record: &R) {
        if let Err(e) = self.write(key, record).await {
            warn!(key, error = %e, "Cache write failed");
            crate::metrics::record_cache_error("set");
        }
    }

    /// Write that reports failure, used for the first write of a new identity.
    pub async fn set_confirmed<R: Serialize + ?Sized>(&self, key: &str, record: &R) -> Result<(), SyncError> {
        self.write(key, record).await.map_err(|source| {
            crate::metrics::record_cache_error("set");
            SyncError::Cache {
                key: key.to_string(),
                source,
            }
        })
    }

    /// True iff a key was actually removed.
    pub async fn delete(&self, key: &str) -> bool {
        let Some(backend) = self.backend.as_ref() else {
            return false;
        };
        match backend.delete(key).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(key, error = %e, "Cache delete failed");
                crate::metrics::record_cache_error("delete");
                false
            }
        }
    }

    /// Best-effort TTL change. True iff the key existed and was updated.
    pub async fn expire(&self, key: &str, ttl: Duration) -> bool {
        let Some(backend) = self.backend.as_ref() else {
            return false;
        };
        match backend.expire(key, ttl).await {
            Ok(applied) => applied,
            Err(e) => {
                warn!(key, error = %e, "Cache expire failed");
                crate::metrics::record_cache_error("expire");
                false
            }
        }
    }

    async fn write<R: Serialize + ?Sized>(&self, key: &str, record: &R) -> Result<(), StorageError> {
        let Some(backend) = self.backend.as_ref() else {
            return Ok(());
        };
        let raw = serde_json::to_string(record).map_err(|e| StorageError::Serialization(e.to_string()))?;
        backend.set(key, &raw, self.ttl).await?;
        debug!(key, bytes = raw.len(), "Cached record");
        Ok(())
    }
}
