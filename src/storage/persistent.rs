// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable tier: one typed store per entity kind.
//!
//! [`PersistentStore<R>`] owns the storage timestamps and the conditional
//! write rules. Backends only see [`RawDocument`]s; everything handed back to
//! callers as `R` has been through schema validation first.
//!
//! # Conditional write
//!
//! [`PersistentStore::create_or_update()`] never overwrites blindly:
//!
//! | stored      | update requested | outcome                                  |
//! |-------------|------------------|------------------------------------------|
//! | none        | any              | create, `modified = true`                |
//! | invalid     | any              | overwrite, `modified = true`             |
//! | valid       | no               | keep stored, `modified = false`          |
//! | equal       | yes              | keep stored, `modified = false`          |
//! | would lose enrichment | yes    | keep stored, `modified = false`          |
//! | otherwise   | yes              | update, `modified = true`                |

use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::traits::{DocumentStore, RawDocument, StorageError};
use crate::error::SyncError;
use crate::identity::{EntityKind, Identity, IdentityRow};
use crate::metrics::LatencyTimer;
use crate::record::{project, Entity, Projection};
use crate::resilience::circuit_breaker::epoch_millis;

/// Outcome of [`PersistentStore::delete()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteResult {
    pub deleted_count: u64,
}

/// Outcome of [`PersistentStore::create_or_update()`].
#[derive(Debug, Clone, PartialEq)]
pub struct Upsert<R> {
    /// The record as stored after the call.
    pub data: R,
    /// Whether anything was written.
    pub modified: bool,
}

pub struct PersistentStore<R> {
    backend: Arc<dyn DocumentStore>,
    _record: PhantomData<fn() -> R>,
}

impl<R: Entity> PersistentStore<R> {
    pub fn new(backend: Arc<dyn DocumentStore>) -> Self {
        Self {
            backend,
            _record: PhantomData,
        }
    }

    #[must_use]
    pub fn kind(&self) -> EntityKind {
        R::KIND
    }

    /// The stored document as-is, storage timestamps included.
    pub async fn find_one(&self, identity: &Identity) -> Result<Option<RawDocument>, SyncError> {
        let _timer = LatencyTimer::new("find");
        self.backend
            .find(R::KIND, identity.asin(), identity.region().code())
            .await
            .map_err(|source| read_error(identity, source))
    }

    /// The stored record, or `None` if absent or if it no longer validates.
    pub async fn find_one_with_projection(&self, identity: &Identity) -> Result<Option<R>, SyncError> {
        Ok(self
            .find_one(identity)
            .await?
            .and_then(|doc| self.projection_of(identity, doc)))
    }

    /// Validate a stored document, logging why it was rejected.
    pub fn projection_of(&self, identity: &Identity, doc: RawDocument) -> Option<R> {
        match project::<R>(doc.body) {
            Projection::Valid(record) => Some(record),
            Projection::Invalid(reason) => {
                warn!(%identity, reason = %reason, "Stored document failed validation");
                None
            }
        }
    }

    /// Insert a new document, stamping both timestamps.
    ///
    /// Returns the record as read back after the write.
    pub async fn create(&self, record: &R) -> Result<R, SyncError> {
        let identity = label_of(record);
        let now = epoch_millis();
        let doc = RawDocument {
            asin: record.asin().to_string(),
            region: record.region().code().to_string(),
            body: to_body(record).map_err(|source| SyncError::Create {
                identity: identity.clone(),
                source,
            })?,
            created_at: now,
            updated_at: now,
        };

        let create_error = |source: StorageError| SyncError::Create {
            identity: identity.clone(),
            source,
        };
        {
            let _timer = LatencyTimer::new("insert");
            self.backend.insert(R::KIND, &doc).await.map_err(create_error)?;
        }

        match self.read_back(&doc.asin, &doc.region).await.map_err(create_error)? {
            Some(Projection::Valid(written)) => {
                debug!(identity = %identity, "Created document");
                Ok(written)
            }
            Some(Projection::Invalid(reason)) => Err(create_error(StorageError::Serialization(reason))),
            None => Err(create_error(StorageError::Backend("document missing after insert".into()))),
        }
    }

    /// Project a document straight after writing it.
    async fn read_back(&self, asin: &str, region: &str) -> Result<Option<Projection<R>>, StorageError> {
        let _timer = LatencyTimer::new("find");
        Ok(self
            .backend
            .find(R::KIND, asin, region)
            .await?
            .map(|doc| project::<R>(doc.body)))
    }

    /// Overwrite an existing document, keeping its `created_at`.
    ///
    /// Returns the record as read back after the write.
    pub async fn update(&self, identity: &Identity, record: &R) -> Result<R, SyncError> {
        let update_error = |source: StorageError| SyncError::Update {
            identity: identity.to_string(),
            source,
        };
        let not_found = || SyncError::StoredNotFound {
            identity: identity.to_string(),
        };

        let Some(existing) = self.find_one(identity).await? else {
            return Err(not_found());
        };

        let doc = RawDocument {
            asin: existing.asin,
            region: existing.region,
            body: to_body(record).map_err(update_error)?,
            created_at: existing.created_at,
            updated_at: epoch_millis().max(existing.updated_at),
        };

        let replaced = {
            let _timer = LatencyTimer::new("replace");
            self.backend.replace(R::KIND, &doc).await.map_err(update_error)?
        };
        if !replaced {
            return Err(not_found());
        }

        match self.read_back(&doc.asin, &doc.region).await.map_err(update_error)? {
            Some(Projection::Valid(record)) => {
                debug!(%identity, "Updated document");
                Ok(record)
            }
            Some(Projection::Invalid(reason)) => Err(update_error(StorageError::Serialization(reason))),
            None => Err(not_found()),
        }
    }

    pub async fn delete(&self, identity: &Identity) -> Result<DeleteResult, SyncError> {
        let _timer = LatencyTimer::new("remove");
        let deleted_count = self
            .backend
            .remove(R::KIND, identity.asin(), identity.region().code())
            .await
            .map_err(|source| SyncError::Delete {
                identity: identity.to_string(),
                source,
            })?;
        Ok(DeleteResult { deleted_count })
    }

    /// Conditional write; see the module docs for the decision table.
    pub async fn create_or_update(
        &self,
        identity: &Identity,
        record: R,
        update_requested: bool,
    ) -> Result<Upsert<R>, SyncError> {
        let stored = match self.find_one(identity).await? {
            None => {
                let data = self.create(&record).await?;
                return Ok(Upsert { data, modified: true });
            }
            Some(doc) => self.projection_of(identity, doc),
        };

        let Some(stored) = stored else {
            let data = self.update(identity, &record).await?;
            return Ok(Upsert { data, modified: true });
        };

        if !update_requested {
            return Ok(Upsert {
                data: stored,
                modified: false,
            });
        }

        if stored == record {
            debug!(%identity, "Fetched record unchanged, skipping write");
            return Ok(Upsert {
                data: stored,
                modified: false,
            });
        }

        if !record.keeps_enrichment_of(&stored) {
            info!(%identity, "Refusing update that would drop stored enrichment");
            crate::metrics::record_guard_refusal(R::KIND.as_str());
            return Ok(Upsert {
                data: stored,
                modified: false,
            });
        }

        let data = self.update(identity, &record).await?;
        Ok(Upsert { data, modified: true })
    }

    /// Stored identities of this kind, most recently updated first.
    pub async fn list_identities(&self) -> Result<Vec<IdentityRow>, SyncError> {
        self.backend
            .list_identities(R::KIND)
            .await
            .map_err(|source| SyncError::Read {
                identity: format!("{} identities", R::KIND),
                source,
            })
    }
}

fn label_of<R: Entity>(record: &R) -> String {
    format!("{} {} ({})", R::KIND, record.asin(), record.region())
}

fn to_body<R: Entity>(record: &R) -> Result<serde_json::Value, StorageError> {
    serde_json::to_value(record).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn read_error(identity: &Identity, source: StorageError) -> SyncError {
    SyncError::Read {
        identity: identity.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Region;
    use crate::record::{Genre, PersonRef, WorkRecord};
    use crate::storage::memory::InMemoryDocuments;
    use serde_json::json;

    const ASIN: &str = "B08G9PRS1K";

    fn work(title: &str, genres: &[&str]) -> WorkRecord {
        WorkRecord {
            asin: ASIN.into(),
            region: Region::Us,
            title: title.into(),
            subtitle: None,
            authors: vec![PersonRef {
                asin: Some("B000AP9A6K".into()),
                name: "Jane Author".into(),
            }],
            narrators: vec![],
            publisher_name: None,
            summary: None,
            release_date: None,
            runtime_length_min: Some(600),
            language: Some("english".into()),
            image: None,
            rating: None,
            format_type: None,
            is_adult: false,
            genres: genres
                .iter()
                .map(|name| Genre {
                    asin: "18580606011".into(),
                    name: (*name).into(),
                    genre_type: "Genres".into(),
                })
                .collect(),
            series_primary: None,
        }
    }

    fn setup() -> (Arc<InMemoryDocuments>, PersistentStore<WorkRecord>, Identity) {
        let docs = Arc::new(InMemoryDocuments::new());
        let store = PersistentStore::new(docs.clone());
        let identity = Identity::new(EntityKind::Work, ASIN, Region::Us).unwrap();
        (docs, store, identity)
    }

    #[tokio::test]
    async fn test_create_then_find() {
        let (docs, store, identity) = setup();
        store.create(&work("Title", &["Fantasy"])).await.unwrap();

        let raw = docs.peek(EntityKind::Work, ASIN, "us").unwrap();
        assert_eq!(raw.created_at, raw.updated_at);
        assert_eq!(store.find_one_with_projection(&identity).await.unwrap(), Some(work("Title", &["Fantasy"])));
    }

    /// Backend that upper-cases titles on insert, like a collation-normalizing database.
    struct ShoutingDocuments(InMemoryDocuments);

    #[async_trait::async_trait]
    impl DocumentStore for ShoutingDocuments {
        async fn find(&self, kind: EntityKind, asin: &str, region: &str) -> Result<Option<RawDocument>, StorageError> {
            self.0.find(kind, asin, region).await
        }

        async fn insert(&self, kind: EntityKind, doc: &RawDocument) -> Result<(), StorageError> {
            let mut doc = doc.clone();
            if let Some(title) = doc.body["title"].as_str().map(str::to_uppercase) {
                doc.body["title"] = json!(title);
            }
            self.0.insert(kind, &doc).await
        }

        async fn replace(&self, kind: EntityKind, doc: &RawDocument) -> Result<bool, StorageError> {
            self.0.replace(kind, doc).await
        }

        async fn remove(&self, kind: EntityKind, asin: &str, region: &str) -> Result<u64, StorageError> {
            self.0.remove(kind, asin, region).await
        }

        async fn list_identities(&self, kind: EntityKind) -> Result<Vec<IdentityRow>, StorageError> {
            self.0.list_identities(kind).await
        }
    }

    #[tokio::test]
    async fn test_create_returns_what_was_stored() {
        let store: PersistentStore<WorkRecord> =
            PersistentStore::new(Arc::new(ShoutingDocuments(InMemoryDocuments::new())));
        let created = store.create(&work("Quiet Case", &[])).await.unwrap();
        assert_eq!(created.title, "QUIET CASE");
    }

    #[tokio::test]
    async fn test_create_twice_is_a_create_error() {
        let (_docs, store, _identity) = setup();
        store.create(&work("Title", &[])).await.unwrap();
        let err = store.create(&work("Title", &[])).await.unwrap_err();
        assert!(matches!(err, SyncError::Create { source: StorageError::Conflict(_), .. }));
    }

    #[tokio::test]
    async fn test_update_missing_document() {
        let (_docs, store, identity) = setup();
        let err = store.update(&identity, &work("Title", &[])).await.unwrap_err();
        assert!(matches!(err, SyncError::StoredNotFound { .. }));
    }

    #[tokio::test]
    async fn test_update_keeps_created_at() {
        let (docs, store, identity) = setup();
        docs.seed(
            EntityKind::Work,
            RawDocument {
                asin: ASIN.into(),
                region: "us".into(),
                body: serde_json::to_value(work("Old", &[])).unwrap(),
                created_at: 1_000,
                updated_at: 2_000,
            },
        );

        let written = store.update(&identity, &work("New", &[])).await.unwrap();
        assert_eq!(written.title, "New");

        let raw = docs.peek(EntityKind::Work, ASIN, "us").unwrap();
        assert_eq!(raw.created_at, 1_000);
        assert!(raw.updated_at > 2_000);
    }

    #[tokio::test]
    async fn test_create_or_update_is_idempotent() {
        let (docs, store, identity) = setup();
        let record = work("Title", &["Fantasy"]);

        let first = store.create_or_update(&identity, record.clone(), false).await.unwrap();
        assert!(first.modified);
        let stamp = docs.peek(EntityKind::Work, ASIN, "us").unwrap().updated_at;

        for update in [false, true] {
            let again = store.create_or_update(&identity, record.clone(), update).await.unwrap();
            assert!(!again.modified);
            assert_eq!(again.data, record);
        }
        assert_eq!(docs.peek(EntityKind::Work, ASIN, "us").unwrap().updated_at, stamp);
    }

    #[tokio::test]
    async fn test_changed_record_only_written_when_update_requested() {
        let (_docs, store, identity) = setup();
        store.create_or_update(&identity, work("Old", &["Fantasy"]), false).await.unwrap();

        let kept = store.create_or_update(&identity, work("New", &["Fantasy"]), false).await.unwrap();
        assert!(!kept.modified);
        assert_eq!(kept.data.title, "Old");

        let updated = store.create_or_update(&identity, work("New", &["Fantasy"]), true).await.unwrap();
        assert!(updated.modified);
        assert_eq!(updated.data.title, "New");
    }

    #[tokio::test]
    async fn test_guard_refuses_dropping_genres() {
        let (_docs, store, identity) = setup();
        store.create_or_update(&identity, work("Title", &["Fantasy"]), false).await.unwrap();

        let outcome = store.create_or_update(&identity, work("Title v2", &[]), true).await.unwrap();
        assert!(!outcome.modified);
        assert_eq!(outcome.data, work("Title", &["Fantasy"]));
    }

    #[tokio::test]
    async fn test_invalid_stored_document_is_overwritten() {
        let (docs, store, identity) = setup();
        docs.seed(
            EntityKind::Work,
            RawDocument {
                asin: ASIN.into(),
                region: "us".into(),
                body: json!({"asin": ASIN, "region": "us"}),
                created_at: 10,
                updated_at: 10,
            },
        );
        assert_eq!(store.find_one_with_projection(&identity).await.unwrap(), None);
        assert!(store.find_one(&identity).await.unwrap().is_some());

        let outcome = store.create_or_update(&identity, work("Fixed", &[]), false).await.unwrap();
        assert!(outcome.modified);
        assert_eq!(docs.peek(EntityKind::Work, ASIN, "us").unwrap().created_at, 10);
    }

    #[tokio::test]
    async fn test_delete_reports_count() {
        let (_docs, store, identity) = setup();
        store.create(&work("Title", &[])).await.unwrap();
        assert_eq!(store.delete(&identity).await.unwrap().deleted_count, 1);
        assert_eq!(store.delete(&identity).await.unwrap().deleted_count, 0);
    }
}
