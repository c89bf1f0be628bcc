// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! Two flavours live here:
//!
//! - [`retry()`] with [`RetryConfig`] presets, used for backend connections and
//!   queries (Redis, SQL).
//! - [`RetryingClient`], the bounded-retry origin fetch. Only an HTTP 200 counts as
//!   success. A 429 waits for the `Retry-After` hint (or exponential backoff), any
//!   other failure retries immediately, and once the budget is spent the caller
//!   gets the last response back untouched.
//!
//! # Example
//!
//! ```
//! use catalog_sync::resilience::retry::{backoff_delay, RetryConfig};
//! use std::time::Duration;
//!
//! let query = RetryConfig::query();
//! assert_eq!(query.attempts, 3);
//! assert_eq!(query.delay_after(2), Duration::from_millis(200));
//!
//! assert_eq!(backoff_delay(0), Duration::from_millis(1000));
//! assert_eq!(backoff_delay(2), Duration::from_millis(4000));
//! assert_eq!(backoff_delay(5), Duration::from_millis(8000));
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::origin::{FetchOptions, HttpTransport, OriginResponse};

/// Attempt budget and backoff curve for backend calls.
///
/// `attempts` counts every call, the first one included, so `attempts: 3`
/// sleeps at most twice before giving up.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::query()
    }
}

impl RetryConfig {
    /// Opening a pool or connection manager: five attempts, about five seconds in total.
    #[must_use]
    pub fn connect() -> Self {
        Self {
            attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Single cache or store command on a live connection.
    #[must_use]
    pub fn query() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Sleep before attempt `attempt + 1`, where `attempt` starts at 1.
    #[must_use]
    pub fn delay_after(&self, attempt: usize) -> Duration {
        let mut delay = self.initial_delay;
        for _ in 1..attempt {
            delay = delay.mul_f64(self.factor).min(self.max_delay);
        }
        delay.min(self.max_delay)
    }
}

/// Run a backend `operation` until it succeeds or `config.attempts` calls have failed.
///
/// The error of the final attempt is returned unchanged.
pub async fn retry<F, Fut, T, E>(operation_name: &str, config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let budget = config.attempts.max(1);
    let mut attempt = 1;

    loop {
        let err = match operation().await {
            Ok(val) => {
                if attempt > 1 {
                    info!(operation = operation_name, attempt, "Backend call recovered");
                }
                return Ok(val);
            }
            Err(err) => err,
        };

        if attempt >= budget {
            return Err(err);
        }
        let delay = config.delay_after(attempt);
        warn!(
            operation = operation_name,
            attempt,
            budget,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Backend call failed, retrying"
        );
        sleep(delay).await;
        attempt += 1;
    }
}

/// Default retry budget for origin fetches.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Longest single wait a `Retry-After` hint can impose by default.
pub const DEFAULT_MAX_RETRY_WAIT: Duration = Duration::from_secs(60);

const BACKOFF_BASE_MS: u64 = 1000;
const BACKOFF_CAP_MS: u64 = 8000;

/// Exponential backoff for rate-limited attempts: `min(1000 * 2^retries, 8000)` ms.
#[must_use]
pub fn backoff_delay(retries: u32) -> Duration {
    let ms = BACKOFF_BASE_MS.saturating_mul(1u64 << retries.min(16));
    Duration::from_millis(ms.min(BACKOFF_CAP_MS))
}

/// How long to wait before retrying after `response`.
///
/// `None` means retry immediately. Only 429 responses wait: for the
/// `Retry-After` seconds if the header parses, otherwise [`backoff_delay()`].
#[must_use]
pub fn rate_limit_delay(response: &OriginResponse, retries: u32) -> Option<Duration> {
    if response.status != 429 {
        return None;
    }
    let hinted = response
        .header("retry-after")
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0);
    Some(match hinted {
        Some(secs) => Duration::from_millis((secs * 1000.0) as u64),
        None => backoff_delay(retries),
    })
}

/// Bounded-retry origin fetch on top of an [`HttpTransport`].
///
/// No circuit breaking happens here; [`crate::origin::Origin`] layers the
/// breaker on top.
#[derive(Clone)]
pub struct RetryingClient {
    transport: Arc<dyn HttpTransport>,
    max_retries: u32,
    max_wait: Duration,
}

impl RetryingClient {
    pub fn new(transport: Arc<dyn HttpTransport>, max_retries: u32) -> Self {
        Self {
            transport,
            max_retries,
            max_wait: DEFAULT_MAX_RETRY_WAIT,
        }
    }

    /// Cap every rate-limit wait at `max_wait`.
    #[must_use]
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Fetch `url`, succeeding only on HTTP 200.
    ///
    /// After `max_retries` retries the last failure is returned: a non-200
    /// response as [`SyncError::Origin`], a connection failure as
    /// [`SyncError::Transport`].
    pub async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<OriginResponse, SyncError> {
        let mut retries = 0u32;

        loop {
            let started = std::time::Instant::now();
            let failure = match self.transport.send(url, options).await {
                Ok(response) if response.status == 200 => {
                    crate::metrics::record_origin_attempt("ok", started.elapsed());
                    if retries > 0 {
                        info!(url, retries, "Origin fetch succeeded after retries");
                    }
                    return Ok(response);
                }
                Ok(response) => {
                    crate::metrics::record_origin_attempt(status_class(response.status), started.elapsed());
                    SyncError::Origin(response)
                }
                Err(err) => {
                    crate::metrics::record_origin_attempt("transport", started.elapsed());
                    err
                }
            };

            if retries >= self.max_retries {
                warn!(url, retries, error = %failure, "Origin fetch exhausted retries");
                return Err(failure);
            }

            let delay = match &failure {
                SyncError::Origin(response) => rate_limit_delay(response, retries),
                _ => None,
            };
            match delay {
                Some(hinted) => {
                    let delay = hinted.min(self.max_wait);
                    if delay < hinted {
                        warn!(
                            url,
                            hinted_ms = hinted.as_millis() as u64,
                            max_wait_ms = self.max_wait.as_millis() as u64,
                            "Retry-After exceeds the wait cap, clamping"
                        );
                    }
                    warn!(url, retries, delay_ms = delay.as_millis() as u64, "Origin rate limited, backing off");
                    sleep(delay).await;
                }
                None => debug!(url, retries, error = %failure, "Origin fetch failed, retrying"),
            }
            retries += 1;
        }
    }
}

fn status_class(status: u16) -> &'static str {
    match status {
        429 => "rate_limited",
        200..=299 => "unexpected_2xx",
        400..=499 => "client_error",
        500..=599 => "server_error",
        _ => "other",
    }
}
