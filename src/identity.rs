// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Identity keys: entity kind, ASIN and region.
//!
//! ```
//! use catalog_sync::{EntityKind, Identity, Region};
//!
//! let id = Identity::parse(EntityKind::Work, "b08g9pRS1k", "uk").unwrap();
//! assert_eq!(id.asin(), "B08G9PRS1K");
//! assert_eq!(id.cache_key(), "uk|work|B08G9PRS1K");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SyncError;

/// The three kinds of entity the engine synchronizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    Author,
    Work,
    ChapterSet,
}

impl EntityKind {
    /// Refresh order: authors first, then works, then chapter sets.
    pub const ALL: [EntityKind; 3] = [Self::Author, Self::Work, Self::ChapterSet];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Author => "author",
            Self::Work => "work",
            Self::ChapterSet => "chapterSet",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Origin locales.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    Au,
    Ca,
    De,
    Es,
    Fr,
    In,
    It,
    Jp,
    Us,
    Uk,
}

impl Region {
    pub const ALL: [Region; 10] = [
        Self::Au,
        Self::Ca,
        Self::De,
        Self::Es,
        Self::Fr,
        Self::In,
        Self::It,
        Self::Jp,
        Self::Us,
        Self::Uk,
    ];

    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Au => "au",
            Self::Ca => "ca",
            Self::De => "de",
            Self::Es => "es",
            Self::Fr => "fr",
            Self::In => "in",
            Self::It => "it",
            Self::Jp => "jp",
            Self::Us => "us",
            Self::Uk => "uk",
        }
    }

    /// Origin TLD for this region.
    #[must_use]
    pub fn tld(&self) -> &'static str {
        match self {
            Self::Au => "com.au",
            Self::Ca => "ca",
            Self::De => "de",
            Self::Es => "es",
            Self::Fr => "fr",
            Self::In => "in",
            Self::It => "it",
            Self::Jp => "co.jp",
            Self::Us => "com",
            Self::Uk => "co.uk",
        }
    }
}

impl Default for Region {
    fn default() -> Self {
        Self::Us
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Region {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|r| r.code() == needle)
            .ok_or_else(|| SyncError::bad_request(format!("invalid region '{}'", s)))
    }
}

/// Length of an origin identifier.
pub const ASIN_LEN: usize = 10;

/// Validate and normalize an ASIN (upper-cased, 10 ASCII alphanumerics).
pub fn normalize_asin(raw: &str) -> Result<String, SyncError> {
    let trimmed = raw.trim();
    if trimmed.len() != ASIN_LEN || !trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(SyncError::bad_request(format!("invalid ASIN '{}'", raw)));
    }
    Ok(trimmed.to_ascii_uppercase())
}

/// Globally unique address of one record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    kind: EntityKind,
    asin: String,
    region: Region,
}

impl Identity {
    /// Build from an already-typed region. The ASIN is validated.
    pub fn new(kind: EntityKind, asin: &str, region: Region) -> Result<Self, SyncError> {
        Ok(Self {
            kind,
            asin: normalize_asin(asin)?,
            region,
        })
    }

    /// Build from raw request strings.
    pub fn parse(kind: EntityKind, asin: &str, region: &str) -> Result<Self, SyncError> {
        Self::new(kind, asin, region.parse()?)
    }

    #[must_use]
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    #[must_use]
    pub fn asin(&self) -> &str {
        &self.asin
    }

    #[must_use]
    pub fn region(&self) -> Region {
        self.region
    }

    /// Cache key: `region|kind|asin`.
    #[must_use]
    pub fn cache_key(&self) -> String {
        format!("{}|{}|{}", self.region.code(), self.kind.as_str(), self.asin)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.kind, self.asin, self.region)
    }
}

/// Projection-only row returned when listing stored identities.
///
/// The region is kept as stored; legacy rows may carry a blank one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRow {
    pub asin: String,
    pub region: String,
}

impl IdentityRow {
    pub fn new(asin: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            asin: asin.into(),
            region: region.into(),
        }
    }

    /// Resolve into a full identity. Blank regions map to `default_region`.
    pub fn to_identity(&self, kind: EntityKind, default_region: Region) -> Result<Identity, SyncError> {
        let region = if self.region.trim().is_empty() {
            default_region
        } else {
            self.region.parse()?
        };
        Identity::new(kind, &self.asin, region)
    }
}
