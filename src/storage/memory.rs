// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process backends for tests and cache-less deployments.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::traits::{CacheStore, DocumentStore, RawDocument, StorageError};
use crate::identity::{EntityKind, IdentityRow};

/// Cache backend with per-entry expiry, checked lazily on read.
pub struct InMemoryCache {
    data: DashMap<String, (String, Instant)>,
}

impl InMemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    /// Number of entries, expired ones included until touched.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&self) {
        self.data.clear();
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let now = Instant::now();
        if let Some(entry) = self.data.get(key) {
            if entry.1 > now {
                return Ok(Some(entry.0.clone()));
            }
        }
        // Only drop the entry if it is still the expired one
        self.data.remove_if(key, |_, (_, at)| *at <= now);
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        self.data.insert(key.to_string(), (value.to_string(), expiry(ttl)));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.data.remove(key).is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StorageError> {
        match self.data.get_mut(key) {
            Some(mut entry) => {
                entry.1 = expiry(ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Deadline `ttl` from now, clamped to one year out.
fn expiry(ttl: Duration) -> Instant {
    Instant::now() + ttl.min(MAX_EXPIRY)
}

const MAX_EXPIRY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

type DocKey = (EntityKind, String, String);

/// Document backend keyed by `(kind, asin, region)`.
pub struct InMemoryDocuments {
    data: DashMap<DocKey, RawDocument>,
}

impl InMemoryDocuments {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Store a document as-is, timestamps included. Used to seed fixtures.
    pub fn seed(&self, kind: EntityKind, doc: RawDocument) {
        self.data
            .insert((kind, doc.asin.clone(), doc.region.clone()), doc);
    }

    /// Read a document without going through the trait (for assertions).
    #[must_use]
    pub fn peek(&self, kind: EntityKind, asin: &str, region: &str) -> Option<RawDocument> {
        self.data
            .get(&(kind, asin.to_string(), region.to_string()))
            .map(|d| d.value().clone())
    }
}

impl Default for InMemoryDocuments {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocuments {
    async fn find(&self, kind: EntityKind, asin: &str, region: &str) -> Result<Option<RawDocument>, StorageError> {
        Ok(self.peek(kind, asin, region))
    }

    async fn insert(&self, kind: EntityKind, doc: &RawDocument) -> Result<(), StorageError> {
        use dashmap::mapref::entry::Entry;
        match self.data.entry((kind, doc.asin.clone(), doc.region.clone())) {
            Entry::Occupied(_) => Err(StorageError::Conflict(format!(
                "{} {} ({})",
                kind, doc.asin, doc.region
            ))),
            Entry::Vacant(slot) => {
                slot.insert(doc.clone());
                Ok(())
            }
        }
    }

    async fn replace(&self, kind: EntityKind, doc: &RawDocument) -> Result<bool, StorageError> {
        match self
            .data
            .get_mut(&(kind, doc.asin.clone(), doc.region.clone()))
        {
            Some(mut existing) => {
                existing.body = doc.body.clone();
                existing.updated_at = doc.updated_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove(&self, kind: EntityKind, asin: &str, region: &str) -> Result<u64, StorageError> {
        Ok(self
            .data
            .remove(&(kind, asin.to_string(), region.to_string()))
            .map_or(0, |_| 1))
    }

    async fn list_identities(&self, kind: EntityKind) -> Result<Vec<IdentityRow>, StorageError> {
        let mut rows: Vec<(i64, IdentityRow)> = self
            .data
            .iter()
            .filter(|e| e.key().0 == kind)
            .map(|e| {
                let doc = e.value();
                (doc.updated_at, IdentityRow::new(doc.asin.clone(), doc.region.clone()))
            })
            .collect();
        rows.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(rows.into_iter().map(|(_, row)| row).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(asin: &str, region: &str, updated_at: i64) -> RawDocument {
        RawDocument {
            asin: asin.into(),
            region: region.into(),
            body: json!({"asin": asin}),
            created_at: 1,
            updated_at,
        }
    }

    #[tokio::test]
    async fn test_cache_set_get_delete() {
        let cache = InMemoryCache::new();
        cache.set("us|work|A", "{}", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("us|work|A").await.unwrap().as_deref(), Some("{}"));
        assert!(cache.delete("us|work|A").await.unwrap());
        assert!(!cache.delete("us|work|A").await.unwrap());
        assert!(cache.get("us|work|A").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_entries_expire() {
        let cache = InMemoryCache::new();
        cache.set("k", "v", Duration::from_secs(10)).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.get("k").await.unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_expire_extends_ttl() {
        let cache = InMemoryCache::new();
        cache.set("k", "v", Duration::from_secs(10)).await.unwrap();
        assert!(cache.expire("k", Duration::from_secs(100)).await.unwrap());
        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(cache.get("k").await.unwrap().is_some());
        assert!(!cache.expire("missing", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_huge_ttl_is_clamped() {
        let cache = InMemoryCache::new();
        cache.set("k", "v", Duration::MAX).await.unwrap();
        assert!(cache.expire("k", Duration::from_secs(u64::MAX)).await.unwrap());
        tokio::time::advance(Duration::from_secs(364 * 24 * 60 * 60)).await;
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));
        tokio::time::advance(Duration::from_secs(2 * 24 * 60 * 60)).await;
        assert!(cache.get("k").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_expired_read_keeps_rewritten_entry() {
        let cache = InMemoryCache::new();
        cache.set("k", "old", Duration::from_secs(10)).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        cache.set("k", "new", Duration::from_secs(10)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("new"));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_documents_insert_conflicts() {
        let docs = InMemoryDocuments::new();
        docs.insert(EntityKind::Work, &doc("B08G9PRS1K", "us", 1)).await.unwrap();
        let err = docs.insert(EntityKind::Work, &doc("B08G9PRS1K", "us", 2)).await;
        assert!(matches!(err, Err(StorageError::Conflict(_))));
        // Same ASIN under another kind is a different document
        docs.insert(EntityKind::ChapterSet, &doc("B08G9PRS1K", "us", 1)).await.unwrap();
        assert_eq!(docs.len(), 2);
    }

    #[tokio::test]
    async fn test_documents_replace_keeps_created_at() {
        let docs = InMemoryDocuments::new();
        docs.insert(EntityKind::Author, &doc("B000AP9A6K", "us", 5)).await.unwrap();

        let mut next = doc("B000AP9A6K", "us", 9);
        next.created_at = 999;
        assert!(docs.replace(EntityKind::Author, &next).await.unwrap());

        let stored = docs.peek(EntityKind::Author, "B000AP9A6K", "us").unwrap();
        assert_eq!(stored.created_at, 1);
        assert_eq!(stored.updated_at, 9);

        assert!(!docs.replace(EntityKind::Author, &doc("B000AP9A6X", "us", 1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_identities_newest_first() {
        let docs = InMemoryDocuments::new();
        docs.seed(EntityKind::Work, doc("AAAAAAAAAA", "us", 10));
        docs.seed(EntityKind::Work, doc("BBBBBBBBBB", "uk", 30));
        docs.seed(EntityKind::Work, doc("CCCCCCCCCC", "de", 20));
        docs.seed(EntityKind::Author, doc("DDDDDDDDDD", "us", 99));

        let rows = docs.list_identities(EntityKind::Work).await.unwrap();
        let asins: Vec<&str> = rows.iter().map(|r| r.asin.as_str()).collect();
        assert_eq!(asins, vec!["BBBBBBBBBB", "CCCCCCCCCC", "AAAAAAAAAA"]);
    }

    #[tokio::test]
    async fn test_remove_counts() {
        let docs = InMemoryDocuments::new();
        docs.seed(EntityKind::Work, doc("AAAAAAAAAA", "us", 10));
        assert_eq!(docs.remove(EntityKind::Work, "AAAAAAAAAA", "us").await.unwrap(), 1);
        assert_eq!(docs.remove(EntityKind::Work, "AAAAAAAAAA", "us").await.unwrap(), 0);
    }
}
