// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batch runner with two nested concurrency ceilings.
//!
//! Every item belongs to a partition (its region). In [`BatchMode::Limited`]
//! an item needs a slot in its partition limiter *and* a slot in the global
//! limiter before its worker runs:
//!
//! ```text
//!            ┌─ partition "us" (≤ R) ─┐
//! items ───▶ ├─ partition "uk" (≤ R) ─┼──▶ global (≤ G) ──▶ worker
//!            └─ partition ...         ┘
//! ```
//!
//! Partition limiters are created lazily and live only for one `run()`.
//! [`BatchMode::Sequential`] skips all of that and runs items one by one.
//!
//! A failing item never aborts the batch: its result slot is `None` and it is
//! counted in [`BatchSummary::failures`].

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};

use crate::error::SyncError;
use crate::identity::{Identity, IdentityRow};

/// Operator cap on the global ceiling when none is configured.
pub const DEFAULT_OPERATOR_MAX: usize = 16;

/// Anything the runner can assign to a partition.
pub trait Partitioned {
    /// Region code, or `None`/blank for the default partition.
    fn partition(&self) -> Option<&str>;
}

impl Partitioned for IdentityRow {
    fn partition(&self) -> Option<&str> {
        Some(self.region.as_str())
    }
}

impl Partitioned for Identity {
    fn partition(&self) -> Option<&str> {
        Some(self.region().code())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BatchMode {
    /// Global and per-partition ceilings.
    Limited,
    /// One item at a time, in input order.
    #[default]
    Sequential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    /// Global ceiling `G`.
    pub concurrency: usize,
    /// Per-partition ceiling `R`, at most `G`.
    pub max_per_partition: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub total: usize,
    pub success: usize,
    pub failures: usize,
    pub per_partition_counts: BTreeMap<String, usize>,
    /// Most workers ever running at once.
    pub peak_concurrency: usize,
    pub per_partition_peak: BTreeMap<String, usize>,
}

#[derive(Debug)]
pub struct BatchOutcome<O> {
    /// One slot per input item, in input order. `None` for failed items.
    pub results: Vec<Option<O>>,
    pub summary: BatchSummary,
}

/// Active-worker counter that remembers its high-water mark.
#[derive(Default)]
struct Gauge {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    fn enter(self: &Arc<Self>) -> GaugeGuard {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        GaugeGuard(self.clone())
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct GaugeGuard(Arc<Gauge>);

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
struct PartitionSlot {
    limiter: Arc<Semaphore>,
    gauge: Arc<Gauge>,
}

#[derive(Debug, Clone)]
pub struct BatchRunner {
    mode: BatchMode,
    operator_max: usize,
    default_partition: String,
}

impl BatchRunner {
    pub fn new(mode: BatchMode, operator_max: usize, default_partition: impl Into<String>) -> Self {
        Self {
            mode,
            operator_max,
            default_partition: default_partition.into(),
        }
    }

    #[must_use]
    pub fn mode(&self) -> BatchMode {
        self.mode
    }

    /// Reject limits the operator did not allow.
    pub fn check_limits(&self, limits: BatchLimits) -> Result<(), SyncError> {
        if limits.concurrency == 0 || limits.concurrency > self.operator_max {
            return Err(SyncError::BatchConfig(format!(
                "concurrency {} must be between 1 and {}",
                limits.concurrency, self.operator_max
            )));
        }
        if limits.max_per_partition == 0 || limits.max_per_partition > limits.concurrency {
            return Err(SyncError::BatchConfig(format!(
                "max_per_partition {} must be between 1 and concurrency {}",
                limits.max_per_partition, limits.concurrency
            )));
        }
        Ok(())
    }

    fn partition_of<T: Partitioned>(&self, item: &T) -> String {
        match item.partition().map(str::trim) {
            Some(p) if !p.is_empty() => p.to_ascii_lowercase(),
            _ => self.default_partition.clone(),
        }
    }

    /// Run `worker` over `items` and summarize.
    ///
    /// Fails up front with [`SyncError::BatchConfig`] if `limits` break the
    /// guardrails; after that, item failures are only counted.
    #[instrument(skip_all, fields(items = items.len(), mode = ?self.mode, concurrency = limits.concurrency, max_per_partition = limits.max_per_partition))]
    pub async fn run<T, O, F, Fut>(&self, items: Vec<T>, worker: F, limits: BatchLimits) -> Result<BatchOutcome<O>, SyncError>
    where
        T: Partitioned + Send + 'static,
        O: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, SyncError>> + Send + 'static,
    {
        self.check_limits(limits)?;

        let outcome = match self.mode {
            BatchMode::Sequential => self.run_sequential(items, worker).await,
            BatchMode::Limited => self.run_limited(items, worker, limits).await,
        };

        let summary = &outcome.summary;
        info!(
            total = summary.total,
            success = summary.success,
            failures = summary.failures,
            peak = summary.peak_concurrency,
            "Batch complete"
        );
        crate::metrics::record_batch(summary.success, summary.failures, summary.peak_concurrency);
        Ok(outcome)
    }

    async fn run_sequential<T, O, F, Fut>(&self, items: Vec<T>, worker: F) -> BatchOutcome<O>
    where
        T: Partitioned,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<O, SyncError>>,
    {
        let mut summary = BatchSummary {
            total: items.len(),
            ..BatchSummary::default()
        };
        let mut results = Vec::with_capacity(items.len());

        for (index, item) in items.into_iter().enumerate() {
            let partition = self.partition_of(&item);
            *summary.per_partition_counts.entry(partition.clone()).or_default() += 1;
            summary.per_partition_peak.insert(partition.clone(), 1);
            summary.peak_concurrency = 1;

            match worker(item).await {
                Ok(value) => {
                    summary.success += 1;
                    results.push(Some(value));
                }
                Err(e) => {
                    warn!(index, partition = %partition, error = %e, "Batch item failed");
                    results.push(None);
                }
            }
        }

        summary.failures = summary.total - summary.success;
        BatchOutcome { results, summary }
    }

    async fn run_limited<T, O, F, Fut>(&self, items: Vec<T>, worker: F, limits: BatchLimits) -> BatchOutcome<O>
    where
        T: Partitioned + Send + 'static,
        O: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, SyncError>> + Send + 'static,
    {
        let total = items.len();
        let worker = Arc::new(worker);
        let global = Arc::new(Semaphore::new(limits.concurrency));
        let global_gauge = Arc::new(Gauge::default());
        let mut registry: HashMap<String, PartitionSlot> = HashMap::new();
        let mut summary = BatchSummary {
            total,
            ..BatchSummary::default()
        };

        let mut tasks = JoinSet::new();
        for (index, item) in items.into_iter().enumerate() {
            let partition = self.partition_of(&item);
            *summary.per_partition_counts.entry(partition.clone()).or_default() += 1;

            let slot = registry
                .entry(partition.clone())
                .or_insert_with(|| PartitionSlot {
                    limiter: Arc::new(Semaphore::new(limits.max_per_partition)),
                    gauge: Arc::new(Gauge::default()),
                })
                .clone();
            let global = global.clone();
            let global_gauge = global_gauge.clone();
            let worker = worker.clone();

            tasks.spawn(async move {
                // Partition first, so a waiting item never sits on a global slot
                let (Ok(_partition_permit), Ok(_global_permit)) =
                    (slot.limiter.acquire_owned().await, global.acquire_owned().await)
                else {
                    return (index, partition, Err(SyncError::BatchConfig("limiter closed".into())));
                };
                let _global_active = global_gauge.enter();
                let _partition_active = slot.gauge.enter();

                let result = (*worker)(item).await;
                (index, partition, result)
            });
        }

        let mut results: Vec<Option<O>> = std::iter::repeat_with(|| None).take(total).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, _, Ok(value))) => {
                    summary.success += 1;
                    results[index] = Some(value);
                }
                Ok((index, partition, Err(e))) => {
                    warn!(index, partition = %partition, error = %e, "Batch item failed");
                }
                Err(e) => {
                    warn!(error = %e, "Batch worker panicked");
                }
            }
        }

        summary.failures = total - summary.success;
        summary.peak_concurrency = global_gauge.peak();
        summary.per_partition_peak = registry
            .into_iter()
            .map(|(partition, slot)| (partition, slot.gauge.peak()))
            .collect();

        BatchOutcome { results, summary }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Job {
        region: &'static str,
        n: usize,
    }

    impl Partitioned for Job {
        fn partition(&self) -> Option<&str> {
            Some(self.region)
        }
    }

    fn jobs(regions: &[&'static str], count: usize) -> Vec<Job> {
        (0..count)
            .map(|n| Job {
                region: regions[n % regions.len()],
                n,
            })
            .collect()
    }

    fn limited() -> BatchRunner {
        BatchRunner::new(BatchMode::Limited, DEFAULT_OPERATOR_MAX, "us")
    }

    #[tokio::test(start_paused = true)]
    async fn test_ten_items_two_regions_respect_ceilings() {
        let outcome = limited()
            .run(
                jobs(&["us", "uk"], 10),
                |job: Job| async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(job.n * 10)
                },
                BatchLimits {
                    concurrency: 4,
                    max_per_partition: 2,
                },
            )
            .await
            .unwrap();

        let summary = &outcome.summary;
        assert_eq!(summary.total, 10);
        assert_eq!(summary.success, 10);
        assert!(summary.peak_concurrency <= 4, "peak {}", summary.peak_concurrency);
        assert!(summary.per_partition_peak.values().all(|&p| p <= 2), "{:?}", summary.per_partition_peak);
        assert_eq!(summary.per_partition_counts.values().sum::<usize>(), 10);
        assert_eq!(summary.per_partition_counts["us"], 5);

        // Results stay in input order
        let values: Vec<usize> = outcome.results.into_iter().map(Option::unwrap).collect();
        assert_eq!(values, (0..10).map(|n| n * 10).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_partition_capped_below_global() {
        let outcome = limited()
            .run(
                jobs(&["de"], 8),
                |_job: Job| async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(())
                },
                BatchLimits {
                    concurrency: 6,
                    max_per_partition: 3,
                },
            )
            .await
            .unwrap();

        assert!(outcome.summary.peak_concurrency <= 3);
        assert_eq!(outcome.summary.per_partition_peak["de"], outcome.summary.peak_concurrency);
    }

    #[tokio::test]
    async fn test_item_failures_are_isolated() {
        let outcome = limited()
            .run(
                jobs(&["us"], 5),
                |job: Job| async move {
                    if job.n % 2 == 0 {
                        Err(SyncError::not_found(format!("item {}", job.n)))
                    } else {
                        Ok(job.n)
                    }
                },
                BatchLimits {
                    concurrency: 2,
                    max_per_partition: 2,
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome.summary.success, 2);
        assert_eq!(outcome.summary.failures, 3);
        assert_eq!(outcome.results, vec![None, Some(1), None, Some(3), None]);
    }

    #[tokio::test]
    async fn test_blank_region_uses_default_partition() {
        let runner = BatchRunner::new(BatchMode::Limited, 4, "us");
        let outcome = runner
            .run(
                vec![Job { region: " ", n: 0 }, Job { region: "UK", n: 1 }],
                |job: Job| async move { Ok(job.n) },
                BatchLimits {
                    concurrency: 2,
                    max_per_partition: 1,
                },
            )
            .await
            .unwrap();

        let partitions: Vec<&str> = outcome.summary.per_partition_counts.keys().map(String::as_str).collect();
        assert_eq!(partitions, vec!["uk", "us"]);
    }

    #[tokio::test]
    async fn test_guardrails_reject_before_any_work() {
        let runner = BatchRunner::new(BatchMode::Limited, 8, "us");
        let calls = Arc::new(AtomicUsize::new(0));

        for limits in [
            BatchLimits { concurrency: 9, max_per_partition: 2 },
            BatchLimits { concurrency: 0, max_per_partition: 0 },
            BatchLimits { concurrency: 4, max_per_partition: 5 },
            BatchLimits { concurrency: 4, max_per_partition: 0 },
        ] {
            let counter = calls.clone();
            let err = runner
                .run(
                    jobs(&["us"], 3),
                    move |_job: Job| {
                        let counter = counter.clone();
                        async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    },
                    limits,
                )
                .await
                .unwrap_err();
            assert!(matches!(err, SyncError::BatchConfig(_)), "{limits:?}");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sequential_mode_runs_in_order() {
        let runner = BatchRunner::new(BatchMode::default(), DEFAULT_OPERATOR_MAX, "us");
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();

        let outcome = runner
            .run(
                jobs(&["us", "fr", "jp"], 6),
                move |job: Job| {
                    let sink = sink.clone();
                    async move {
                        sink.lock().push(job.n);
                        Ok(job.n)
                    }
                },
                BatchLimits {
                    concurrency: 4,
                    max_per_partition: 2,
                },
            )
            .await
            .unwrap();

        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(outcome.summary.peak_concurrency, 1);
        assert_eq!(outcome.summary.per_partition_counts.len(), 3);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let outcome = limited()
            .run(
                Vec::<Job>::new(),
                |job: Job| async move { Ok(job.n) },
                BatchLimits {
                    concurrency: 1,
                    max_per_partition: 1,
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.summary, BatchSummary::default());
        assert!(outcome.results.is_empty());
    }
}
