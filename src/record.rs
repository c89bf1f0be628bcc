// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Normalized records and their schema validation.
//!
//! A normalized record is what a source fetcher produces and what the engine
//! stores and caches. It never carries storage metadata; `created_at` and
//! `updated_at` live on [`crate::storage::RawDocument`].
//!
//! Anything read back from a cache or a store goes through [`project()`], which
//! returns a [`Projection`]: either a valid record or the reason it was rejected.
//!
//! # Example
//!
//! ```
//! use catalog_sync::record::{project, AuthorRecord, Projection};
//! use catalog_sync::Region;
//! use serde_json::json;
//!
//! let raw = json!({"asin": "B000AP9A6K", "region": "us", "name": "Jane Author"});
//! match project::<AuthorRecord>(raw) {
//!     Projection::Valid(author) => assert_eq!(author.region, Region::Us),
//!     Projection::Invalid(reason) => panic!("{reason}"),
//! }
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::identity::{normalize_asin, EntityKind, Region};

/// Behaviour shared by the three normalized record kinds.
pub trait Entity:
    Serialize + DeserializeOwned + Clone + PartialEq + fmt::Debug + Send + Sync + 'static
{
    const KIND: EntityKind;

    fn asin(&self) -> &str;

    fn region(&self) -> Region;

    /// Kind-specific checks beyond what deserialization enforces.
    fn check(&self) -> Result<(), String>;

    /// Non-regression guard: false if writing `self` over `stored` would drop
    /// enrichment data that `stored` already has.
    fn keeps_enrichment_of(&self, stored: &Self) -> bool;
}

/// Outcome of validating an untrusted JSON value against a record schema.
#[derive(Debug, Clone, PartialEq)]
pub enum Projection<R> {
    Valid(R),
    Invalid(String),
}

impl<R> Projection<R> {
    pub fn valid(self) -> Option<R> {
        match self {
            Self::Valid(r) => Some(r),
            Self::Invalid(_) => None,
        }
    }
}

/// Parse and validate a JSON value as `R`.
pub fn project<R: Entity>(value: Value) -> Projection<R> {
    match serde_json::from_value::<R>(value) {
        Ok(record) => match validate(&record) {
            Ok(()) => Projection::Valid(record),
            Err(reason) => Projection::Invalid(reason),
        },
        Err(e) => Projection::Invalid(e.to_string()),
    }
}

/// Validate an already-typed record.
pub fn validate<R: Entity>(record: &R) -> Result<(), String> {
    match normalize_asin(record.asin()) {
        Ok(normalized) if normalized == record.asin() => {}
        _ => return Err(format!("asin '{}' is not a normalized ASIN", record.asin())),
    }
    record.check()
}

fn require_text(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        Err(format!("`{}` must not be empty", field))
    } else {
        Ok(())
    }
}

/// Genre or tag attached to authors and works.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Genre {
    pub asin: String,
    pub name: String,
    #[serde(rename = "type")]
    pub genre_type: String,
}

/// Reference to a person (author, narrator) by name and optional ASIN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asin: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asin: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorRecord {
    pub asin: String,
    pub region: Region,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default)]
    pub genres: Vec<Genre>,
    #[serde(default)]
    pub similar: Vec<PersonRef>,
}

impl Entity for AuthorRecord {
    const KIND: EntityKind = EntityKind::Author;

    fn asin(&self) -> &str {
        &self.asin
    }

    fn region(&self) -> Region {
        self.region
    }

    fn check(&self) -> Result<(), String> {
        require_text("name", &self.name)
    }

    fn keeps_enrichment_of(&self, stored: &Self) -> bool {
        stored.genres.is_empty() || !self.genres.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkRecord {
    pub asin: String,
    pub region: Region,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    pub authors: Vec<PersonRef>,
    #[serde(default)]
    pub narrators: Vec<PersonRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_length_min: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format_type: Option<String>,
    #[serde(default)]
    pub is_adult: bool,
    #[serde(default)]
    pub genres: Vec<Genre>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series_primary: Option<SeriesRef>,
}

impl Entity for WorkRecord {
    const KIND: EntityKind = EntityKind::Work;

    fn asin(&self) -> &str {
        &self.asin
    }

    fn region(&self) -> Region {
        self.region
    }

    fn check(&self) -> Result<(), String> {
        require_text("title", &self.title)?;
        if self.authors.is_empty() {
            return Err("`authors` must not be empty".to_string());
        }
        Ok(())
    }

    fn keeps_enrichment_of(&self, stored: &Self) -> bool {
        stored.genres.is_empty() || !self.genres.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    pub length_ms: u64,
    pub start_offset_ms: u64,
    pub start_offset_sec: u64,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterSetRecord {
    pub asin: String,
    pub region: Region,
    #[serde(default)]
    pub brand_intro_duration_ms: u64,
    #[serde(default)]
    pub brand_outro_duration_ms: u64,
    #[serde(default)]
    pub is_accurate: bool,
    pub runtime_length_ms: u64,
    #[serde(default)]
    pub chapters: Vec<Chapter>,
}

impl Entity for ChapterSetRecord {
    const KIND: EntityKind = EntityKind::ChapterSet;

    fn asin(&self) -> &str {
        &self.asin
    }

    fn region(&self) -> Region {
        self.region
    }

    fn check(&self) -> Result<(), String> {
        for (i, chapter) in self.chapters.iter().enumerate() {
            if chapter.start_offset_ms > self.runtime_length_ms {
                return Err(format!(
                    "chapter {} starts at {}ms, past runtime {}ms",
                    i, chapter.start_offset_ms, self.runtime_length_ms
                ));
            }
        }
        Ok(())
    }

    fn keeps_enrichment_of(&self, stored: &Self) -> bool {
        stored.chapters.is_empty() || !self.chapters.is_empty()
    }
}
