// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage tiers and their backends.
//!
//! - [`cache::RecordCache`] over a [`traits::CacheStore`] (Redis or in-memory)
//! - [`persistent::PersistentStore`] over a [`traits::DocumentStore`] (SQL or in-memory)

pub mod cache;
pub mod memory;
pub mod persistent;
pub mod redis;
pub mod sql;
pub mod traits;

pub use cache::RecordCache;
pub use persistent::{DeleteResult, PersistentStore, Upsert};
pub use traits::{CacheStore, DocumentStore, RawDocument, StorageError};
