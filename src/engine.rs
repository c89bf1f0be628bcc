// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The read-through chain for one entity kind.
//!
//! ```text
//! handler(identity, options)
//!   │
//!   ├─ 1. cache hit, no update requested ──────────────▶ return cached
//!   │
//!   ├─ 2. store lookup (raw document)
//!   │     ├─ found, update requested
//!   │     │     ├─ updated within recency window ──────▶ return stored
//!   │     │     └─ fetch ▶ create_or_update ▶ cache ───▶ return
//!   │     ├─ found, no update ▶ cache ─────────────────▶ return stored
//!   │     └─ found but invalid ─────────────┐
//!   │                                       ▼
//!   └─ 3. not found: fetch ▶ create_or_update ▶ confirmed cache write ▶ return
//! ```
//!
//! Tiers are consulted strictly in order; the origin is only reached when the
//! cheaper tiers cannot answer.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, instrument, warn};

use crate::error::SyncError;
use crate::identity::{EntityKind, Identity, IdentityRow};
use crate::record::{project, validate, Entity, Projection};
use crate::resilience::circuit_breaker::epoch_millis;
use crate::scheduler::RefreshTarget;
use crate::source::SourceFetcher;
use crate::storage::{PersistentStore, RawDocument, RecordCache};

/// Stored records younger than this are not refreshed.
pub const DEFAULT_RECENCY_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Ask for a refresh from the origin, subject to the recency window.
    pub update: bool,
}

impl SyncOptions {
    pub const READ: Self = Self { update: false };
    pub const REFRESH: Self = Self { update: true };
}

pub struct SyncEngine<R> {
    cache: RecordCache,
    store: PersistentStore<R>,
    fetcher: Arc<dyn SourceFetcher<R>>,
    recency_window: Duration,
}

impl<R: Entity> SyncEngine<R> {
    pub fn new(cache: RecordCache, store: PersistentStore<R>, fetcher: Arc<dyn SourceFetcher<R>>) -> Self {
        Self {
            cache,
            store,
            fetcher,
            recency_window: DEFAULT_RECENCY_WINDOW,
        }
    }

    #[must_use]
    pub fn with_recency_window(mut self, window: Duration) -> Self {
        self.recency_window = window;
        self
    }

    pub fn cache(&self) -> &RecordCache {
        &self.cache
    }

    pub fn store(&self) -> &PersistentStore<R> {
        &self.store
    }

    /// Resolve `identity` through cache, store and origin.
    ///
    /// `Ok(None)` means the origin has no data for this identity.
    #[instrument(skip_all, fields(kind = %identity.kind(), asin = identity.asin(), region = %identity.region(), update = options.update))]
    pub async fn handler(&self, identity: &Identity, options: SyncOptions) -> Result<Option<R>, SyncError> {
        if identity.kind() != R::KIND {
            return Err(SyncError::bad_request(format!(
                "{} handler cannot serve {}",
                R::KIND,
                identity
            )));
        }

        let start = Instant::now();
        let result = self.resolve(identity, options).await;
        crate::metrics::record_handler(R::KIND.as_str(), outcome_label(&result), start.elapsed());
        result
    }

    async fn resolve(&self, identity: &Identity, options: SyncOptions) -> Result<Option<R>, SyncError> {
        let key = identity.cache_key();

        if !options.update {
            if let Some(value) = self.cache.get(&key).await {
                match project::<R>(value) {
                    Projection::Valid(record) => {
                        crate::metrics::record_tier_lookup(R::KIND.as_str(), "cache", true);
                        debug!(tier = "cache", "Served from cache");
                        return Ok(Some(record));
                    }
                    Projection::Invalid(reason) => {
                        warn!(tier = "cache", reason = %reason, "Cached record failed validation");
                    }
                }
            }
            crate::metrics::record_tier_lookup(R::KIND.as_str(), "cache", false);
        }

        let Some(doc) = self.store.find_one(identity).await? else {
            crate::metrics::record_tier_lookup(R::KIND.as_str(), "store", false);
            return self.fetch_and_store(identity).await;
        };
        crate::metrics::record_tier_lookup(R::KIND.as_str(), "store", true);

        if options.update {
            return self.refresh_stored(identity, doc).await.map_err(|e| {
                if e.is_classified() {
                    e
                } else {
                    error!(%identity, error = %e, "Update failed");
                    SyncError::UpdateFailed {
                        identity: identity.to_string(),
                        source: Box::new(e),
                    }
                }
            });
        }

        match self.store.projection_of(identity, doc) {
            Some(record) => {
                debug!(tier = "store", "Served from store");
                self.cache.set(&key, &record).await;
                Ok(Some(record))
            }
            None => self.fetch_and_store(identity).await,
        }
    }

    /// Update path for an identity that is already stored.
    async fn refresh_stored(&self, identity: &Identity, doc: RawDocument) -> Result<Option<R>, SyncError> {
        let age_ms = epoch_millis().saturating_sub(doc.updated_at).max(0) as u128;
        let current = self.store.projection_of(identity, doc);

        if let Some(stored) = &current {
            if age_ms < self.recency_window.as_millis() {
                debug!(age_ms = age_ms as u64, "Stored record is recent, skipping refresh");
                crate::metrics::record_refresh_skipped(R::KIND.as_str());
                return Ok(Some(stored.clone()));
            }
        }

        let Some(fresh) = self.fetch_valid(identity).await? else {
            return Ok(current);
        };

        let upsert = self.store.create_or_update(identity, fresh, true).await?;
        debug!(modified = upsert.modified, "Refreshed from origin");
        self.cache.set(&identity.cache_key(), &upsert.data).await;
        Ok(Some(upsert.data))
    }

    /// Create path: nothing usable is stored.
    async fn fetch_and_store(&self, identity: &Identity) -> Result<Option<R>, SyncError> {
        let Some(record) = self.fetch_valid(identity).await? else {
            return Ok(None);
        };

        let upsert = self
            .store
            .create_or_update(identity, record, false)
            .await
            .inspect_err(|e| error!(%identity, error = %e, "Persisting fetched record failed"))?;

        if let Err(e) = self.cache.set_confirmed(&identity.cache_key(), &upsert.data).await {
            warn!(%identity, error = %e, "First cache write failed");
        }
        Ok(Some(upsert.data))
    }

    /// Ask the fetcher, then make sure the answer is a valid record for this identity.
    async fn fetch_valid(&self, identity: &Identity) -> Result<Option<R>, SyncError> {
        let Some(record) = self.fetcher.process(identity.asin(), identity.region()).await? else {
            debug!(tier = "origin", "Origin has no data");
            return Ok(None);
        };

        let checked = validate(&record).and_then(|()| {
            if record.asin() == identity.asin() && record.region() == identity.region() {
                Ok(())
            } else {
                Err(format!(
                    "fetched record is {} ({}), expected {}",
                    record.asin(),
                    record.region(),
                    identity
                ))
            }
        });

        if let Err(detail) = checked {
            error!(%identity, detail = %detail, "Fetched record failed validation");
            return Err(SyncError::Validation {
                identity: identity.to_string(),
                detail,
            });
        }
        Ok(Some(record))
    }
}

fn outcome_label<R>(result: &Result<Option<R>, SyncError>) -> &'static str {
    match result {
        Ok(Some(_)) => "ok",
        Ok(None) => "empty",
        Err(e) => e.label(),
    }
}

#[async_trait]
impl<R: Entity> RefreshTarget for SyncEngine<R> {
    fn kind(&self) -> EntityKind {
        R::KIND
    }

    async fn list_identities(&self) -> Result<Vec<IdentityRow>, SyncError> {
        self.store.list_identities().await
    }

    async fn refresh(&self, identity: &Identity) -> Result<bool, SyncError> {
        Ok(self.handler(identity, SyncOptions::REFRESH).await?.is_some())
    }
}
