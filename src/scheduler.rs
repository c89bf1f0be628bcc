// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Periodic bulk refresh of everything in the durable store.
//!
//! One cycle walks the kinds in a fixed order (author, work, chapter-set). For
//! each kind it lists the stored identities and hands them to the configured
//! [`RefreshStrategy`]:
//!
//! - [`ParallelRefresh`]: through a [`BatchRunner`] with region partitions
//! - [`PacedRefresh`]: one at a time with a random pause between items
//!
//! Cycles never overlap. The first one starts as soon as the scheduler is
//! spawned.

use async_trait::async_trait;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::batch::{BatchLimits, BatchRunner, BatchSummary};
use crate::error::SyncError;
use crate::identity::{EntityKind, Identity, IdentityRow, Region};

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 24 * 60 * 60);
pub const DEFAULT_PACED_DELAY_MAX: Duration = Duration::from_millis(5000);

/// One entity kind as seen by the scheduler.
#[async_trait]
pub trait RefreshTarget: Send + Sync {
    fn kind(&self) -> EntityKind;

    /// Stored identities, most recently updated first.
    async fn list_identities(&self) -> Result<Vec<IdentityRow>, SyncError>;

    /// Refresh one identity. `Ok(false)` if the origin had no data.
    async fn refresh(&self, identity: &Identity) -> Result<bool, SyncError>;
}

/// How one kind's identities get refreshed.
#[async_trait]
pub trait RefreshStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn refresh_all(
        &self,
        target: Arc<dyn RefreshTarget>,
        rows: Vec<IdentityRow>,
        default_region: Region,
    ) -> Result<BatchSummary, SyncError>;
}

async fn refresh_row(target: &dyn RefreshTarget, row: &IdentityRow, default_region: Region) -> Result<bool, SyncError> {
    let identity = row.to_identity(target.kind(), default_region)?;
    target.refresh(&identity).await
}

/// Concurrent refresh under the batch runner's ceilings.
pub struct ParallelRefresh {
    runner: BatchRunner,
    limits: BatchLimits,
}

impl ParallelRefresh {
    /// Fails if `limits` break the runner's guardrails.
    pub fn new(runner: BatchRunner, limits: BatchLimits) -> Result<Self, SyncError> {
        runner.check_limits(limits)?;
        Ok(Self { runner, limits })
    }
}

#[async_trait]
impl RefreshStrategy for ParallelRefresh {
    fn name(&self) -> &'static str {
        "parallel"
    }

    async fn refresh_all(
        &self,
        target: Arc<dyn RefreshTarget>,
        rows: Vec<IdentityRow>,
        default_region: Region,
    ) -> Result<BatchSummary, SyncError> {
        let outcome = self
            .runner
            .run(
                rows,
                move |row: IdentityRow| {
                    let target = target.clone();
                    async move { refresh_row(target.as_ref(), &row, default_region).await }
                },
                self.limits,
            )
            .await?;
        Ok(outcome.summary)
    }
}

/// Sequential refresh with a random pause of up to `max_delay` between items.
pub struct PacedRefresh {
    max_delay: Duration,
}

impl PacedRefresh {
    pub fn new(max_delay: Duration) -> Self {
        Self { max_delay }
    }

    fn next_delay(&self) -> Duration {
        let max_ms = self.max_delay.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

impl Default for PacedRefresh {
    fn default() -> Self {
        Self::new(DEFAULT_PACED_DELAY_MAX)
    }
}

#[async_trait]
impl RefreshStrategy for PacedRefresh {
    fn name(&self) -> &'static str {
        "paced"
    }

    async fn refresh_all(
        &self,
        target: Arc<dyn RefreshTarget>,
        rows: Vec<IdentityRow>,
        default_region: Region,
    ) -> Result<BatchSummary, SyncError> {
        let mut summary = BatchSummary {
            total: rows.len(),
            ..BatchSummary::default()
        };

        for (index, row) in rows.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.next_delay()).await;
            }

            let partition = match row.region.trim() {
                "" => default_region.code().to_string(),
                region => region.to_ascii_lowercase(),
            };
            *summary.per_partition_counts.entry(partition.clone()).or_default() += 1;
            summary.per_partition_peak.insert(partition, 1);
            summary.peak_concurrency = 1;

            match refresh_row(target.as_ref(), row, default_region).await {
                Ok(_) => summary.success += 1,
                Err(e) => warn!(kind = %target.kind(), asin = %row.asin, region = %row.region, error = %e, "Refresh failed"),
            }
        }

        summary.failures = summary.total - summary.success;
        Ok(summary)
    }
}

/// Process memory as reported by the kernel, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemorySnapshot {
    /// Data segment size (`VmData`), the closest thing to heap usage
    pub heap_bytes: Option<u64>,
    /// Resident set size (`VmRSS`)
    pub rss_bytes: Option<u64>,
}

impl MemorySnapshot {
    /// Read `/proc/self/status`. Both fields are `None` where that is unavailable.
    #[must_use]
    pub fn capture() -> Self {
        std::fs::read_to_string("/proc/self/status")
            .map(|status| Self::parse_status(&status))
            .unwrap_or_default()
    }

    /// Parse the `VmData:` and `VmRSS:` lines (values in kB).
    #[must_use]
    pub fn parse_status(status: &str) -> Self {
        let field = |name: &str| {
            status.lines().find_map(|line| {
                let rest = line.strip_prefix(name)?.strip_prefix(':')?;
                let kb = rest.split_whitespace().next()?.parse::<u64>().ok()?;
                Some(kb * 1024)
            })
        };
        Self {
            heap_bytes: field("VmData"),
            rss_bytes: field("VmRSS"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseReport {
    pub kind: EntityKind,
    pub summary: BatchSummary,
    pub memory_before: MemorySnapshot,
    pub memory_after: MemorySnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub phases: Vec<PhaseReport>,
    pub elapsed: Duration,
}

impl CycleReport {
    /// Per-kind totals, handy for logs.
    pub fn totals(&self) -> BTreeMap<&'static str, (usize, usize)> {
        self.phases
            .iter()
            .map(|p| (p.kind.as_str(), (p.summary.success, p.summary.failures)))
            .collect()
    }
}

/// Clears the in-flight flag when a cycle ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn try_enter(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct RefreshScheduler {
    targets: Vec<Arc<dyn RefreshTarget>>,
    strategy: Arc<dyn RefreshStrategy>,
    interval: Duration,
    default_region: Region,
    in_flight: AtomicBool,
}

impl RefreshScheduler {
    /// Targets are put in refresh order whatever order they are given in.
    pub fn new(
        mut targets: Vec<Arc<dyn RefreshTarget>>,
        strategy: Arc<dyn RefreshStrategy>,
        interval: Duration,
        default_region: Region,
    ) -> Self {
        targets.sort_by_key(|t| EntityKind::ALL.iter().position(|k| *k == t.kind()));
        Self {
            targets,
            strategy,
            interval: interval.max(Duration::from_secs(1)),
            default_region,
            in_flight: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Run one full cycle. `None` if another cycle is still in flight.
    #[tracing::instrument(skip(self), fields(strategy = self.strategy.name()))]
    pub async fn run_cycle(&self) -> Option<CycleReport> {
        let Some(_in_flight) = InFlight::try_enter(&self.in_flight) else {
            warn!("Previous refresh cycle still running, skipping");
            return None;
        };

        let start = Instant::now();
        info!(kinds = self.targets.len(), "Refresh cycle starting");

        let mut phases = Vec::with_capacity(self.targets.len());
        for target in &self.targets {
            phases.push(self.run_phase(target.clone()).await);
        }

        let report = CycleReport {
            phases,
            elapsed: start.elapsed(),
        };
        info!(elapsed_ms = report.elapsed.as_millis() as u64, totals = ?report.totals(), "Refresh cycle complete");
        Some(report)
    }

    async fn run_phase(&self, target: Arc<dyn RefreshTarget>) -> PhaseReport {
        let kind = target.kind();
        let memory_before = MemorySnapshot::capture();
        log_memory(kind, "before", memory_before);

        let summary = match target.list_identities().await {
            Ok(rows) => {
                info!(%kind, count = rows.len(), "Refreshing stored identities");
                match self.strategy.refresh_all(target, rows, self.default_region).await {
                    Ok(summary) => summary,
                    Err(e) => {
                        error!(%kind, error = %e, "Refresh phase aborted");
                        BatchSummary::default()
                    }
                }
            }
            Err(e) => {
                error!(%kind, error = %e, "Could not list identities");
                BatchSummary::default()
            }
        };

        let memory_after = MemorySnapshot::capture();
        log_memory(kind, "after", memory_after);
        crate::metrics::record_refresh_phase(kind.as_str(), summary.success, summary.failures);

        PhaseReport {
            kind,
            summary,
            memory_before,
            memory_after,
        }
    }

    /// Run cycles every `interval` until `shutdown` flips to true or its sender drops.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = self.interval.as_secs(), strategy = self.strategy.name(), "Refresh scheduler started");

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Refresh scheduler stopping");
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        self.run_cycle().await;
                    }
                }
            }
        })
    }
}

fn log_memory(kind: EntityKind, when: &'static str, snapshot: MemorySnapshot) {
    info!(%kind, when, heap_bytes = ?snapshot.heap_bytes, rss_bytes = ?snapshot.rss_bytes, "Memory usage");
    crate::metrics::set_memory(snapshot.heap_bytes, snapshot.rss_bytes);
}
