// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker guarding the origin.
//!
//! One breaker instance is shared by every caller in the process so that the
//! failure signal aggregates across all concurrent fetches.
//!
//! States:
//! - Closed: Normal operation, requests pass through
//! - Open: Origin unhealthy, requests fail-fast without attempting
//! - HalfOpen: Testing if the origin recovered
//!
//! ```text
//! Closed ──(failure_count >= failure_threshold)──▶ Open
//! Open ──(first call after reset_timeout)──▶ HalfOpen
//! HalfOpen ──(success_count >= success_threshold)──▶ Closed
//! HalfOpen ──(any failure)──▶ Open
//! ```
//!
//! The Open → HalfOpen transition is evaluated lazily on each call attempt;
//! there is no background timer.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::SyncError;

/// Successes are counted up to this value and then saturate.
pub const SUCCESS_COUNT_CAP: u32 = 1_000_000;

/// Circuit breaker state for metrics/monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Error type for circuit-protected operations
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit breaker rejected the call (circuit is open)
    #[error("circuit '{circuit}' open, retry in {retry_after:?}")]
    Rejected { circuit: String, retry_after: Duration },

    /// The underlying operation failed
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl From<CircuitError<SyncError>> for SyncError {
    fn from(err: CircuitError<SyncError>) -> Self {
        match err {
            CircuitError::Rejected { circuit, retry_after } => SyncError::CircuitOpen {
                circuit,
                retry_after_secs: retry_after.as_millis().div_ceil(1000) as u64,
            },
            CircuitError::Inner(e) => e,
        }
    }
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitConfig {
    /// Number of consecutive failures to trip the circuit
    pub failure_threshold: u32,
    /// Number of consecutive successes in half-open to close circuit
    pub success_threshold: u32,
    /// How long to stay open before letting a probe through
    pub reset_timeout: Duration,
}

impl CircuitConfig {
    pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
    pub const DEFAULT_RESET_TIMEOUT_MS: u64 = 60_000;
    pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 2;

    /// Build from raw numeric settings.
    ///
    /// Each value is floored; non-finite values and values below 1 fall back to
    /// the defaults (5 failures, 60 000 ms, 2 successes).
    ///
    /// ```
    /// use catalog_sync::CircuitConfig;
    /// use std::time::Duration;
    ///
    /// let cfg = CircuitConfig::from_raw(3.7, f64::NAN, 0.0);
    /// assert_eq!(cfg.failure_threshold, 3);
    /// assert_eq!(cfg.reset_timeout, Duration::from_millis(60_000));
    /// assert_eq!(cfg.success_threshold, 2);
    /// ```
    #[must_use]
    pub fn from_raw(failure_threshold: f64, reset_timeout_ms: f64, success_threshold: f64) -> Self {
        Self {
            failure_threshold: sanitize("failure_threshold", failure_threshold, Self::DEFAULT_FAILURE_THRESHOLD as u64)
                as u32,
            reset_timeout: Duration::from_millis(sanitize(
                "reset_timeout_ms",
                reset_timeout_ms,
                Self::DEFAULT_RESET_TIMEOUT_MS,
            )),
            success_threshold: sanitize("success_threshold", success_threshold, Self::DEFAULT_SUCCESS_THRESHOLD as u64)
                as u32,
        }
    }

    /// Never trip. Counters and stats keep working.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.failure_threshold = u32::MAX;
        self
    }

    /// Fast recovery for testing
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
            reset_timeout: Duration::from_millis(1000),
        }
    }
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: Self::DEFAULT_FAILURE_THRESHOLD,
            success_threshold: Self::DEFAULT_SUCCESS_THRESHOLD,
            reset_timeout: Duration::from_millis(Self::DEFAULT_RESET_TIMEOUT_MS),
        }
    }
}

fn sanitize(name: &str, raw: f64, default: u64) -> u64 {
    if !raw.is_finite() {
        warn!(setting = name, value = raw, default, "Non-finite circuit setting, using default");
        return default;
    }
    let floored = raw.floor();
    if floored < 1.0 {
        warn!(setting = name, value = raw, default, "Circuit setting below 1, using default");
        return default;
    }
    floored.min(u32::MAX as f64) as u64
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Epoch millis of the last failed call
    pub last_failure_at: Option<i64>,
    /// Epoch millis of the last successful call
    pub last_success_at: Option<i64>,
    /// Epoch millis after which an open circuit lets a probe through
    pub next_attempt_at: Option<i64>,
    pub calls_total: u64,
    pub rejections: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<i64>,
    last_success_at: Option<i64>,
    next_attempt: Option<(Instant, i64)>,
}

impl BreakerInner {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            last_success_at: None,
            next_attempt: None,
        }
    }
}

/// A named circuit breaker with metrics tracking
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    inner: Mutex<BreakerInner>,

    // Metrics
    calls_total: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let name = name.into();
        crate::metrics::set_circuit_state(&name, CircuitState::Closed as u8);
        Self {
            name,
            config,
            inner: Mutex::new(BreakerInner::closed()),
            calls_total: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitConfig::default())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Current state, after applying any due Open → HalfOpen transition.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.poll(&mut inner, Instant::now());
        inner.state
    }

    /// Whether a call made now would be let through.
    #[must_use]
    pub fn can_execute(&self) -> bool {
        self.state() != CircuitState::Open
    }

    /// Execute an async operation through the circuit breaker.
    ///
    /// Takes a closure that returns a Future, so nothing runs when the
    /// circuit rejects the call.
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        if let Err(retry_after) = self.admit() {
            self.rejections.fetch_add(1, Ordering::Relaxed);
            debug!(circuit = %self.name, retry_after_ms = retry_after.as_millis() as u64, "Circuit open, rejecting call");
            crate::metrics::record_circuit_call(&self.name, "rejected");
            return Err(CircuitError::Rejected {
                circuit: self.name.clone(),
                retry_after,
            });
        }

        match f().await {
            Ok(value) => {
                self.on_success();
                crate::metrics::record_circuit_call(&self.name, "success");
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                crate::metrics::record_circuit_call(&self.name, "failure");
                Err(CircuitError::Inner(e))
            }
        }
    }

    /// Snapshot of state and counters.
    #[must_use]
    pub fn stats(&self) -> CircuitStats {
        let mut inner = self.inner.lock();
        self.poll(&mut inner, Instant::now());
        CircuitStats {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_at: inner.last_failure_at,
            last_success_at: inner.last_success_at,
            next_attempt_at: inner.next_attempt.map(|(_, epoch)| epoch),
            calls_total: self.calls_total.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
        }
    }

    /// Back to Closed with all counters cleared.
    pub fn reset(&self) {
        *self.inner.lock() = BreakerInner::closed();
        self.calls_total.store(0, Ordering::Relaxed);
        self.rejections.store(0, Ordering::Relaxed);
        crate::metrics::set_circuit_state(&self.name, CircuitState::Closed as u8);
        info!(circuit = %self.name, "Circuit reset");
    }

    /// Open → HalfOpen once the reset timeout has passed.
    fn poll(&self, inner: &mut BreakerInner, now: Instant) {
        if inner.state != CircuitState::Open {
            return;
        }
        if let Some((at, _)) = inner.next_attempt {
            if now >= at {
                inner.failure_count = 0;
                inner.success_count = 0;
                inner.next_attempt = None;
                self.transition(inner, CircuitState::HalfOpen);
            }
        }
    }

    /// Ok to proceed, or the time left until a probe is allowed.
    fn admit(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.poll(&mut inner, now);
        match (inner.state, inner.next_attempt) {
            (CircuitState::Open, Some((at, _))) => Err(at.saturating_duration_since(now)),
            (CircuitState::Open, None) => Err(Duration::ZERO),
            _ => Ok(()),
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        inner.last_success_at = Some(epoch_millis());
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.success_count = (inner.success_count + 1).min(SUCCESS_COUNT_CAP);
            }
            CircuitState::HalfOpen => {
                inner.success_count = (inner.success_count + 1).min(SUCCESS_COUNT_CAP);
                if inner.success_count >= self.config.success_threshold {
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            // A call admitted before the circuit opened; it does not close it.
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock();
        inner.last_failure_at = Some(epoch_millis());
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = inner.failure_count.saturating_add(1);
                if inner.failure_count >= self.config.failure_threshold {
                    self.trip(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                inner.failure_count = inner.failure_count.saturating_add(1);
                self.trip(&mut inner);
            }
            CircuitState::Open => {}
        }
    }

    fn trip(&self, inner: &mut BreakerInner) {
        let at = Instant::now() + self.config.reset_timeout;
        let epoch = epoch_millis() + self.config.reset_timeout.as_millis() as i64;
        inner.next_attempt = Some((at, epoch));
        self.transition(inner, CircuitState::Open);
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        crate::metrics::set_circuit_state(&self.name, to as u8);
        match to {
            CircuitState::Open => warn!(
                circuit = %self.name,
                %from,
                failures = inner.failure_count,
                reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
                "Circuit opened"
            ),
            _ => info!(circuit = %self.name, %from, %to, "Circuit state changed"),
        }
    }
}

pub(crate) fn epoch_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    async fn fail(cb: &CircuitBreaker) -> Result<i32, CircuitError<&'static str>> {
        cb.execute(|| async { Err("boom") }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<i32, CircuitError<&'static str>> {
        cb.execute(|| async { Ok(1) }).await
    }

    #[tokio::test]
    async fn test_circuit_passes_successful_calls() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test());
        let result: Result<i32, CircuitError<&str>> = cb.execute(|| async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
        let stats = cb.stats();
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.failure_count, 0);
        assert!(stats.last_success_at.is_some());
    }

    #[tokio::test]
    async fn test_three_failures_trip_and_fourth_call_is_not_invoked() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test());
        for _ in 0..3 {
            assert!(matches!(fail(&cb).await, Err(CircuitError::Inner("boom"))));
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let invoked = Arc::new(AtomicUsize::new(0));
        let invoked_clone = invoked.clone();
        let result: Result<i32, CircuitError<&str>> = cb
            .execute(|| async move {
                invoked_clone.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
            .await;

        assert!(matches!(result, Err(CircuitError::Rejected { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(cb.stats().rejections, 1);
        assert!(!cb.can_execute());
    }

    #[tokio::test]
    async fn test_success_in_closed_resets_failure_count() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test());
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        let _ = succeed(&cb).await;
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().failure_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_reset_timeout() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test());
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        tokio::time::advance(Duration::from_millis(999)).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(cb.can_execute());
        let stats = cb.stats();
        assert_eq!(stats.state, CircuitState::HalfOpen);
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.success_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_closes_after_success_threshold() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test());
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        tokio::time::advance(Duration::from_secs(2)).await;

        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().success_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test());
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        tokio::time::advance(Duration::from_secs(2)).await;
        succeed(&cb).await.unwrap();
        let _ = fail(&cb).await;

        let stats = cb.stats();
        assert_eq!(stats.state, CircuitState::Open);
        assert!(stats.next_attempt_at.is_some());

        match succeed(&cb).await {
            Err(CircuitError::Rejected { retry_after, .. }) => {
                assert_eq!(retry_after, Duration::from_millis(1000));
            }
            other => panic!("expected rejection, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_rejection_maps_to_circuit_open_error() {
        let cb = CircuitBreaker::new("origin", CircuitConfig::test());
        for _ in 0..3 {
            let _: Result<(), _> = cb
                .execute(|| async { Err::<(), _>(SyncError::not_found("x")) })
                .await;
        }
        let err: SyncError = cb
            .execute(|| async { Ok::<(), SyncError>(()) })
            .await
            .map_err(SyncError::from)
            .unwrap_err();
        match err {
            SyncError::CircuitOpen { circuit, retry_after_secs } => {
                assert_eq!(circuit, "origin");
                assert_eq!(retry_after_secs, 1);
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[tokio::test]
    async fn test_inner_error_passes_through_unchanged() {
        let cb = CircuitBreaker::new("origin", CircuitConfig::test());
        let err: SyncError = cb
            .execute(|| async { Err::<(), _>(SyncError::not_found("no such work")) })
            .await
            .map_err(SyncError::from)
            .unwrap_err();
        assert_eq!(err.status_code(), Some(404));
    }

    #[tokio::test]
    async fn test_disabled_breaker_never_trips_but_counts() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test().disabled());
        for _ in 0..50 {
            let _ = fail(&cb).await;
        }
        let stats = cb.stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 50);
        assert_eq!(stats.calls_total, 50);
        assert!(stats.last_failure_at.is_some());
    }

    #[tokio::test]
    async fn test_reset_clears_everything() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test());
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        cb.reset();
        let stats = cb.stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.calls_total, 0);
        assert_eq!(stats.next_attempt_at, None);
    }

    #[test]
    fn test_config_sanitizes_raw_values() {
        let cfg = CircuitConfig::from_raw(f64::INFINITY, -5.0, 0.99);
        assert_eq!(cfg, CircuitConfig::default());

        let cfg = CircuitConfig::from_raw(10.9, 1500.2, 3.0);
        assert_eq!(cfg.failure_threshold, 10);
        assert_eq!(cfg.reset_timeout, Duration::from_millis(1500));
        assert_eq!(cfg.success_threshold, 3);
    }
}
