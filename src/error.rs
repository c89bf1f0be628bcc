// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy for the sync engine.
//!
//! Errors fall into two families:
//!
//! - **Classified** errors ([`SyncError::NotFound`], [`SyncError::BadRequest`],
//!   [`SyncError::ContentTypeMismatch`]) carry a stable status code. They are raised by
//!   source fetchers and travel through every layer untouched.
//! - Everything else is **unclassified**. It is wrapped exactly once, where it is
//!   detected, with a message naming the operation and identity.
//!
//! [`SyncError::status_code()`] is what the request-routing layer uses to pick a response.

use crate::origin::OriginResponse;
use crate::storage::traits::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The origin has no such entity.
    #[error("{message}")]
    NotFound { message: String },

    /// The request itself was malformed (bad ASIN, unknown region).
    #[error("{message}")]
    BadRequest { message: String },

    /// The origin returned an entity of a different content type than requested.
    #[error("{message}")]
    ContentTypeMismatch { message: String },

    /// The origin answered, but never with a 200 within the retry budget.
    #[error("origin responded with status {} for {}", .0.status, .0.url)]
    Origin(OriginResponse),

    /// The origin could not be reached at all.
    #[error("origin request to {url} failed: {message}")]
    Transport { url: String, message: String },

    /// The HTTP client could not be built.
    #[error("http client setup failed: {0}")]
    Client(String),

    /// The origin circuit is open; calls fail fast until the reset timeout elapses.
    #[error("circuit '{circuit}' is open, retry in {retry_after_secs}s")]
    CircuitOpen { circuit: String, retry_after_secs: u64 },

    /// A normalized record failed schema validation.
    #[error("data type mismatch for {identity}")]
    Validation { identity: String, detail: String },

    #[error("failed to create {identity}: {source}")]
    Create {
        identity: String,
        #[source]
        source: StorageError,
    },

    #[error("failed to update {identity}: {source}")]
    Update {
        identity: String,
        #[source]
        source: StorageError,
    },

    #[error("failed to delete {identity}: {source}")]
    Delete {
        identity: String,
        #[source]
        source: StorageError,
    },

    #[error("failed to read {identity}: {source}")]
    Read {
        identity: String,
        #[source]
        source: StorageError,
    },

    /// An update was requested for a document that is not stored.
    #[error("no stored document for {identity}")]
    StoredNotFound { identity: String },

    /// A confirmed cache write did not go through.
    #[error("cache write for '{key}' failed: {source}")]
    Cache {
        key: String,
        #[source]
        source: StorageError,
    },

    /// Refresh of an existing identity failed for an unclassified reason.
    #[error("update failed for {identity}")]
    UpdateFailed {
        identity: String,
        #[source]
        source: Box<SyncError>,
    },

    /// Batch limits violate the operator guardrails.
    #[error("invalid batch configuration: {0}")]
    BatchConfig(String),
}

impl SyncError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound { message: message.into() }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest { message: message.into() }
    }

    pub fn content_type_mismatch(message: impl Into<String>) -> Self {
        Self::ContentTypeMismatch { message: message.into() }
    }

    /// Stable status classification, if this error carries one.
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::NotFound { .. } => Some(404),
            Self::BadRequest { .. } | Self::ContentTypeMismatch { .. } => Some(400),
            _ => None,
        }
    }

    /// Classified errors must never be rewrapped.
    #[must_use]
    pub fn is_classified(&self) -> bool {
        self.status_code().is_some()
    }

    /// Short label used for metrics and log fields.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::BadRequest { .. } => "bad_request",
            Self::ContentTypeMismatch { .. } => "content_type_mismatch",
            Self::Origin(resp) if resp.status == 429 => "rate_limited",
            Self::Origin(_) => "origin",
            Self::Transport { .. } | Self::Client(_) => "transport",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Validation { .. } => "validation",
            Self::Create { .. } | Self::Update { .. } | Self::Delete { .. } | Self::Read { .. } => {
                "persistence"
            }
            Self::StoredNotFound { .. } => "stored_not_found",
            Self::Cache { .. } => "cache",
            Self::UpdateFailed { .. } => "update_failed",
            Self::BatchConfig(_) => "batch_config",
        }
    }
}
