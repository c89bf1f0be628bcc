// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Source fetchers turn an identity into a freshly normalized record.
//!
//! Mapping origin payloads into records is the fetcher's business; the engine
//! only relies on the contract of [`SourceFetcher::process()`]:
//!
//! - `Ok(Some(record))`: fresh data
//! - `Ok(None)`: the origin has nothing for this identity (chapter-sets do this)
//! - `Err(NotFound | BadRequest | ContentTypeMismatch)`: passed through as-is
//! - any other `Err`: wrapped by the engine where it matters

use async_trait::async_trait;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::SyncError;
use crate::identity::Region;
use crate::origin::{FetchOptions, Origin};
use crate::record::Entity;

#[async_trait]
pub trait SourceFetcher<R>: Send + Sync {
    async fn process(&self, asin: &str, region: Region) -> Result<Option<R>, SyncError>;
}

type UrlBuilder = dyn Fn(&str, Region) -> String + Send + Sync;

/// Fetcher for origin endpoints that already answer in the normalized shape.
///
/// A 404 becomes [`SyncError::NotFound`], an empty body or `null` means no
/// data, and anything else must deserialize into `R`.
pub struct JsonSourceFetcher<R> {
    origin: Arc<Origin>,
    url_for: Box<UrlBuilder>,
    options: FetchOptions,
    _record: PhantomData<fn() -> R>,
}

impl<R: Entity> JsonSourceFetcher<R> {
    pub fn new(origin: Arc<Origin>, url_for: impl Fn(&str, Region) -> String + Send + Sync + 'static) -> Self {
        Self {
            origin,
            url_for: Box::new(url_for),
            options: FetchOptions::default().header("accept", "application/json"),
            _record: PhantomData,
        }
    }
}

#[async_trait]
impl<R: Entity> SourceFetcher<R> for JsonSourceFetcher<R> {
    async fn process(&self, asin: &str, region: Region) -> Result<Option<R>, SyncError> {
        let url = (self.url_for)(asin, region);
        let response = match self.origin.fetch(&url, &self.options).await {
            Ok(response) => response,
            Err(SyncError::Origin(response)) if response.status == 404 => {
                return Err(SyncError::not_found(format!("{} {} not found in region {}", R::KIND, asin, region)));
            }
            Err(e) => return Err(e),
        };

        let body = response.body.trim();
        if body.is_empty() || body == "null" {
            return Ok(None);
        }

        response.json::<R>().map(Some).map_err(|e| SyncError::Validation {
            identity: format!("{} {} ({})", R::KIND, asin, region),
            detail: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::origin::{OriginResponse, ScriptedTransport};
    use crate::record::AuthorRecord;
    use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig};
    use crate::resilience::retry::RetryingClient;

    fn fetcher(script: Vec<Result<OriginResponse, String>>) -> JsonSourceFetcher<AuthorRecord> {
        let origin = Origin::new(
            RetryingClient::new(Arc::new(ScriptedTransport::new(script)), 0),
            Arc::new(CircuitBreaker::new("origin", CircuitConfig::default())),
        );
        JsonSourceFetcher::new(Arc::new(origin), |asin, region| {
            format!("https://api.example.{}/authors/{}", region.tld(), asin)
        })
    }

    #[tokio::test]
    async fn test_parses_record() {
        let f = fetcher(vec![Ok(OriginResponse::new("", 200)
            .with_body(r#"{"asin":"B000AP9A6K","region":"uk","name":"Jane Author"}"#))]);
        let author = f.process("B000AP9A6K", Region::Uk).await.unwrap().unwrap();
        assert_eq!(author.name, "Jane Author");
    }

    #[tokio::test]
    async fn test_404_is_classified_not_found() {
        let f = fetcher(vec![Ok(OriginResponse::new("", 404))]);
        let err = f.process("B000AP9A6K", Region::Us).await.unwrap_err();
        assert_eq!(err.status_code(), Some(404));
    }

    #[tokio::test]
    async fn test_null_body_means_no_data() {
        let f = fetcher(vec![Ok(OriginResponse::new("", 200).with_body("null"))]);
        assert!(f.process("B000AP9A6K", Region::Us).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_wrong_shape_is_validation_error() {
        let f = fetcher(vec![Ok(OriginResponse::new("", 200).with_body(r#"{"title":"x"}"#))]);
        let err = f.process("B000AP9A6K", Region::Us).await.unwrap_err();
        assert!(matches!(err, SyncError::Validation { .. }));
    }
}
