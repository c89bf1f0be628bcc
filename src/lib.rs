// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Catalog Sync
//!
//! A tiered read-through engine for catalog metadata (authors, works and
//! chapter-sets) fetched from a rate-limited origin.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 SyncEngine::handler(identity)               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Cache (Redis, TTL)                       │
//! │  • Failures count as a miss, never as an error             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ miss
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                PersistentStore (SQLite/MySQL)               │
//! │  • Ground truth, validated projections                     │
//! │  • Non-regression guard on refresh                         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ absent or stale
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Origin                              │
//! │  • Circuit breaker → bounded retries → pooled HTTP client  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! A [`RefreshScheduler`] walks the whole store periodically, either paced one
//! item at a time or through a [`BatchRunner`] with per-region ceilings.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use catalog_sync::storage::memory::{InMemoryCache, InMemoryDocuments};
//! use catalog_sync::{
//!     AuthorRecord, EntityKind, Identity, JsonSourceFetcher, PersistentStore, RecordCache,
//!     Region, SyncConfig, SyncEngine, SyncOptions,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), catalog_sync::SyncError> {
//!     let config = SyncConfig::from_env();
//!     let origin = Arc::new(config.origin()?);
//!
//!     let engine = SyncEngine::new(
//!         RecordCache::new(Arc::new(InMemoryCache::new()), config.cache_ttl()),
//!         PersistentStore::<AuthorRecord>::new(Arc::new(InMemoryDocuments::new())),
//!         Arc::new(JsonSourceFetcher::new(origin, |asin, region| {
//!             format!("https://api.example.{}/authors/{}", region.tld(), asin)
//!         })),
//!     );
//!
//!     let id = Identity::new(EntityKind::Author, "B000AP9A6K", Region::Uk)?;
//!     if let Some(author) = engine.handler(&id, SyncOptions::READ).await? {
//!         println!("{}", author.name);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`engine`]: the per-kind [`SyncEngine`]
//! - [`storage`]: cache and durable store tiers (Redis, SQL, memory)
//! - [`origin`]: HTTP transport and the shared [`Origin`]
//! - [`resilience`]: circuit breaker and retry logic
//! - [`batch`]: bounded, partitioned batch execution
//! - [`scheduler`]: the periodic refresh job

pub mod batch;
pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod origin;
pub mod record;
pub mod resilience;
pub mod scheduler;
pub mod source;
pub mod storage;

// Note: We don't expose a `tracing` module to avoid conflict with the tracing crate

pub use batch::{BatchLimits, BatchMode, BatchOutcome, BatchRunner, BatchSummary, Partitioned};
pub use config::SyncConfig;
pub use engine::{SyncEngine, SyncOptions};
pub use error::SyncError;
pub use identity::{EntityKind, Identity, IdentityRow, Region};
pub use metrics::LatencyTimer;
pub use origin::{FetchOptions, HttpTransport, Origin, OriginResponse, ReqwestTransport, ScriptedTransport};
pub use record::{AuthorRecord, Chapter, ChapterSetRecord, Entity, Genre, PersonRef, Projection, SeriesRef, WorkRecord};
pub use resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitState, CircuitStats};
pub use resilience::retry::{RetryConfig, RetryingClient};
pub use scheduler::{
    CycleReport, MemorySnapshot, PacedRefresh, ParallelRefresh, PhaseReport, RefreshScheduler, RefreshStrategy,
    RefreshTarget,
};
pub use source::{JsonSourceFetcher, SourceFetcher};
pub use storage::{CacheStore, DeleteResult, DocumentStore, PersistentStore, RawDocument, RecordCache, StorageError, Upsert};
