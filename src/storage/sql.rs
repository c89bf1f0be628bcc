// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL backend for the durable document store.
//!
//! All three entity kinds share one table; `kind` is part of the key:
//! ```sql
//! CREATE TABLE documents (
//!   kind VARCHAR(32) NOT NULL,
//!   asin VARCHAR(16) NOT NULL,
//!   region VARCHAR(8) NOT NULL,
//!   body LONGTEXT NOT NULL,      -- normalized record as JSON text
//!   created_at BIGINT NOT NULL,  -- epoch millis, set once
//!   updated_at BIGINT NOT NULL,  -- epoch millis, every write
//!   PRIMARY KEY (kind, asin, region)
//! )
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! The body is TEXT rather than a native JSON column because the `Any` driver
//! has no mapping for MySQL's JSON type, and it reports LONGTEXT as a blob, so
//! text columns are read as `String` with a `Vec<u8>` fallback.

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use serde_json::Value;
use sqlx::{AnyPool, Row};
use std::sync::Once;
use std::time::Duration;
use tracing::warn;

use super::traits::{DocumentStore, RawDocument, StorageError};
use crate::identity::{EntityKind, IdentityRow};
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

pub struct SqlDocumentStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlDocumentStore {
    /// Connect with the connect retry preset and
    /// create the schema if needed.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");
        // Every connection to an in-memory SQLite URL opens its own database
        let in_memory = is_sqlite && connection_string.contains(":memory:");
        let max_connections = if in_memory { 1 } else { 20 };

        let pool = retry("sql_connect", &RetryConfig::connect(), || async {
            AnyPoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(if in_memory { None } else { Some(Duration::from_secs(300)) })
                .max_lifetime(if in_memory { None } else { Some(Duration::from_secs(1800)) })
                .connect(connection_string)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let store = Self { pool, is_sqlite };

        if is_sqlite && !in_memory {
            store.enable_wal_mode().await?;
        }

        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    /// WAL keeps readers unblocked while the scheduler writes.
    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements: &[&str] = if self.is_sqlite {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS documents (
                    kind TEXT NOT NULL,
                    asin TEXT NOT NULL,
                    region TEXT NOT NULL,
                    body TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    PRIMARY KEY (kind, asin, region)
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_documents_updated ON documents (kind, updated_at)",
            ]
        } else {
            &[r#"
                CREATE TABLE IF NOT EXISTS documents (
                    kind VARCHAR(32) NOT NULL,
                    asin VARCHAR(16) NOT NULL,
                    region VARCHAR(8) NOT NULL,
                    body LONGTEXT NOT NULL,
                    created_at BIGINT NOT NULL,
                    updated_at BIGINT NOT NULL,
                    PRIMARY KEY (kind, asin, region),
                    INDEX idx_documents_updated (kind, updated_at)
                )
                "#]
        };

        for sql in statements {
            retry("sql_init_schema", &RetryConfig::connect(), || async {
                sqlx::query(sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| StorageError::Backend(e.to_string()))
            })
            .await?;
        }

        Ok(())
    }
}

/// Read a text column as String (SQLite TEXT) or bytes (MySQL LONGTEXT).
fn text_column(row: &AnyRow, column: &str) -> Result<String, StorageError> {
    row.try_get::<String, _>(column)
        .ok()
        .or_else(|| {
            row.try_get::<Vec<u8>, _>(column)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        })
        .ok_or_else(|| StorageError::Backend(format!("column '{}' is not readable as text", column)))
}

fn millis_column(row: &AnyRow, column: &str) -> Result<i64, StorageError> {
    row.try_get::<i64, _>(column)
        .map_err(|e| StorageError::Backend(format!("column '{}' is not readable as epoch millis: {}", column, e)))
}

/// Parse a stored body. Text that is not JSON is kept as a JSON string so
/// projection rejects it and the record is refetched instead of failing the read.
fn body_value(kind: EntityKind, asin: &str, region: &str, raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or_else(|e| {
        warn!(%kind, asin, region, error = %e, "Stored body is not JSON");
        Value::String(raw)
    })
}

#[async_trait]
impl DocumentStore for SqlDocumentStore {
    async fn find(&self, kind: EntityKind, asin: &str, region: &str) -> Result<Option<RawDocument>, StorageError> {
        let row = retry("sql_find", &RetryConfig::query(), || async {
            sqlx::query(
                "SELECT body, created_at, updated_at FROM documents WHERE kind = ? AND asin = ? AND region = ?",
            )
            .bind(kind.as_str())
            .bind(asin)
            .bind(region)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(RawDocument {
            asin: asin.to_string(),
            region: region.to_string(),
            body: body_value(kind, asin, region, text_column(&row, "body")?),
            created_at: millis_column(&row, "created_at")?,
            updated_at: millis_column(&row, "updated_at")?,
        }))
    }

    async fn insert(&self, kind: EntityKind, doc: &RawDocument) -> Result<(), StorageError> {
        let body = serde_json::to_string(&doc.body).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let sql = if self.is_sqlite {
            "INSERT INTO documents (kind, asin, region, body, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(kind, asin, region) DO NOTHING"
        } else {
            "INSERT IGNORE INTO documents (kind, asin, region, body, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)"
        };

        let inserted = retry("sql_insert", &RetryConfig::query(), || async {
            let result = sqlx::query(sql)
                .bind(kind.as_str())
                .bind(&doc.asin)
                .bind(&doc.region)
                .bind(&body)
                .bind(doc.created_at)
                .bind(doc.updated_at)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(result.rows_affected())
        })
        .await?;

        if inserted == 0 {
            return Err(StorageError::Conflict(format!("{} {} ({})", kind, doc.asin, doc.region)));
        }
        Ok(())
    }

    async fn replace(&self, kind: EntityKind, doc: &RawDocument) -> Result<bool, StorageError> {
        let body = serde_json::to_string(&doc.body).map_err(|e| StorageError::Serialization(e.to_string()))?;

        // MySQL reports 0 affected rows for a no-op write, so existence is checked separately
        if self.find(kind, &doc.asin, &doc.region).await?.is_none() {
            return Ok(false);
        }

        retry("sql_replace", &RetryConfig::query(), || async {
            sqlx::query("UPDATE documents SET body = ?, updated_at = ? WHERE kind = ? AND asin = ? AND region = ?")
                .bind(&body)
                .bind(doc.updated_at)
                .bind(kind.as_str())
                .bind(&doc.asin)
                .bind(&doc.region)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(true)
        })
        .await
    }

    async fn remove(&self, kind: EntityKind, asin: &str, region: &str) -> Result<u64, StorageError> {
        retry("sql_remove", &RetryConfig::query(), || async {
            let result = sqlx::query("DELETE FROM documents WHERE kind = ? AND asin = ? AND region = ?")
                .bind(kind.as_str())
                .bind(asin)
                .bind(region)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn list_identities(&self, kind: EntityKind) -> Result<Vec<IdentityRow>, StorageError> {
        retry("sql_list_identities", &RetryConfig::query(), || async {
            let rows = sqlx::query("SELECT asin, region FROM documents WHERE kind = ? ORDER BY updated_at DESC")
                .bind(kind.as_str())
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;

            rows.iter()
                .map(|row| Ok(IdentityRow::new(text_column(row, "asin")?, text_column(row, "region")?)))
                .collect()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{project, AuthorRecord, Projection};

    async fn store_with_row(body: &str, updated_at: &str) -> SqlDocumentStore {
        let store = SqlDocumentStore::new("sqlite::memory:").await.unwrap();
        sqlx::query(&format!(
            "INSERT INTO documents (kind, asin, region, body, created_at, updated_at) \
             VALUES ('author', 'B000AP9A6K', 'us', ?, 1, {updated_at})"
        ))
        .bind(body)
        .execute(&store.pool)
        .await
        .unwrap();
        store
    }

    #[tokio::test]
    async fn test_corrupt_body_reads_as_invalid_document() {
        let store = store_with_row("{not json", "2").await;

        let doc = store.find(EntityKind::Author, "B000AP9A6K", "us").await.unwrap().unwrap();
        assert_eq!(doc.body, Value::String("{not json".into()));
        assert_eq!((doc.created_at, doc.updated_at), (1, 2));
        assert!(matches!(project::<AuthorRecord>(doc.body), Projection::Invalid(_)));
    }

    #[tokio::test]
    async fn test_unreadable_timestamp_is_a_backend_error() {
        let store = store_with_row("{}", "'yesterday'").await;

        let err = store.find(EntityKind::Author, "B000AP9A6K", "us").await.unwrap_err();
        assert!(matches!(err, StorageError::Backend(_)), "{err}");
    }

    #[tokio::test]
    async fn test_missing_row_is_none() {
        let store = SqlDocumentStore::new("sqlite::memory:").await.unwrap();
        assert!(store.find(EntityKind::Work, "B000AP9A6K", "us").await.unwrap().is_none());
    }
}
