// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use crate::identity::{EntityKind, IdentityRow};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Document already exists: {0}")]
    Conflict(String),
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// A stored document exactly as the backend returned it.
///
/// `body` is untrusted until it has been projected through
/// [`crate::record::project()`].
#[derive(Debug, Clone, PartialEq)]
pub struct RawDocument {
    pub asin: String,
    pub region: String,
    pub body: Value,
    /// Epoch millis, set once at first insert
    pub created_at: i64,
    /// Epoch millis, stamped on every write
    pub updated_at: i64,
}

/// Key-value cache service holding serialized records.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError>;
    /// Returns true iff a key was actually removed.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;
    /// Returns true iff the key existed and now carries the new TTL.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StorageError>;
}

/// Document database holding one collection per entity kind.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn find(&self, kind: EntityKind, asin: &str, region: &str) -> Result<Option<RawDocument>, StorageError>;

    /// Insert a new document. Fails with [`StorageError::Conflict`] if it exists.
    async fn insert(&self, kind: EntityKind, doc: &RawDocument) -> Result<(), StorageError>;

    /// Replace body and `updated_at` of an existing document.
    /// Returns false if no document matched.
    async fn replace(&self, kind: EntityKind, doc: &RawDocument) -> Result<bool, StorageError>;

    async fn remove(&self, kind: EntityKind, asin: &str, region: &str) -> Result<u64, StorageError>;

    /// All stored identities of a kind, most recently updated first.
    async fn list_identities(&self, kind: EntityKind) -> Result<Vec<IdentityRow>, StorageError>;
}
