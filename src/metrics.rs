// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for catalog-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `catalog_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//! - `_bytes` suffix for memory gauges
//!
//! # Labels
//! - `kind`: author, work, chapterSet
//! - `tier`: cache, store
//! - `outcome`: ok, not_found, error, ...

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════
// HANDLER - Top-level request outcomes
// ═══════════════════════════════════════════════════════════════════════════

/// Record one `SyncEngine::handler` call
pub fn record_handler(kind: &str, outcome: &str, duration: Duration) {
    counter!(
        "catalog_sync_handler_total",
        "kind" => kind.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!(
        "catalog_sync_handler_seconds",
        "kind" => kind.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a hit or miss on one tier
pub fn record_tier_lookup(kind: &str, tier: &str, hit: bool) {
    let outcome = if hit { "hit" } else { "miss" };
    counter!(
        "catalog_sync_tier_lookups_total",
        "kind" => kind.to_string(),
        "tier" => tier.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record a refresh that was skipped because the stored record is recent
pub fn record_refresh_skipped(kind: &str) {
    counter!(
        "catalog_sync_refresh_skipped_total",
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record an update refused by the non-regression guard
pub fn record_guard_refusal(kind: &str) {
    counter!(
        "catalog_sync_guard_refusals_total",
        "kind" => kind.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// BACKENDS - Cache and store health
// ═══════════════════════════════════════════════════════════════════════════

/// Record a swallowed cache failure
pub fn record_cache_error(operation: &str) {
    counter!(
        "catalog_sync_cache_errors_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record durable store latency
pub fn record_store_latency(operation: &str, duration: Duration) {
    histogram!(
        "catalog_sync_store_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// ORIGIN - HTTP attempts and circuit breaker
// ═══════════════════════════════════════════════════════════════════════════

/// Record one HTTP attempt against the origin (retries count separately)
pub fn record_origin_attempt(outcome: &str, duration: Duration) {
    counter!(
        "catalog_sync_origin_attempts_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("catalog_sync_origin_attempt_seconds").record(duration.as_secs_f64());
}

/// Record circuit breaker state change (0 = closed, 1 = half-open, 2 = open)
pub fn set_circuit_state(circuit: &str, state: u8) {
    gauge!(
        "catalog_sync_circuit_breaker_state",
        "circuit" => circuit.to_string()
    )
    .set(state as f64);
}

/// Record circuit breaker call
pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "catalog_sync_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// BATCH / REFRESH - Bulk work
// ═══════════════════════════════════════════════════════════════════════════

/// Record a finished batch run
pub fn record_batch(success: usize, failures: usize, peak_concurrency: usize) {
    counter!("catalog_sync_batch_items_total", "status" => "success").increment(success as u64);
    counter!("catalog_sync_batch_items_total", "status" => "failure").increment(failures as u64);
    gauge!("catalog_sync_batch_peak_concurrency").set(peak_concurrency as f64);
}

/// Record one refresh phase (one entity kind within a cycle)
pub fn record_refresh_phase(kind: &str, success: usize, failures: usize) {
    counter!(
        "catalog_sync_refresh_items_total",
        "kind" => kind.to_string(),
        "status" => "success"
    )
    .increment(success as u64);
    counter!(
        "catalog_sync_refresh_items_total",
        "kind" => kind.to_string(),
        "status" => "failure"
    )
    .increment(failures as u64);
}

/// Set process memory gauges; unknown values are left untouched
pub fn set_memory(heap_bytes: Option<u64>, rss_bytes: Option<u64>) {
    if let Some(bytes) = heap_bytes {
        gauge!("catalog_sync_memory_heap_bytes").set(bytes as f64);
    }
    if let Some(bytes) = rss_bytes {
        gauge!("catalog_sync_memory_rss_bytes").set(bytes as f64);
    }
}

/// A timing guard that records store latency on drop
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_store_latency(self.operation, self.start.elapsed());
    }
}
