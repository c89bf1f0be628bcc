// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic catalog-sync usage example.
//!
//! Demonstrates:
//! 1. Wiring cache, store and a scripted origin into per-kind engines
//! 2. Read-through: origin on first read, cache afterwards
//! 3. Refresh inside the recency window (origin untouched)
//! 4. One refresh cycle over every stored identity
//! 5. Displaying metrics (OTEL-compatible)
//!
//! Runs offline: the store is in-memory SQLite unless `CATALOG_SYNC_SQL_URL`
//! is set, and the cache is Redis only if `CATALOG_SYNC_REDIS_URL` is set.
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::sync::Arc;
use std::time::Instant;

use catalog_sync::storage::memory::InMemoryCache;
use catalog_sync::storage::redis::RedisCache;
use catalog_sync::storage::sql::SqlDocumentStore;
use catalog_sync::{
    AuthorRecord, CacheStore, CircuitBreaker, EntityKind, Identity, JsonSourceFetcher, Origin, OriginResponse,
    PersistentStore, RecordCache, RefreshScheduler, RefreshTarget, Region, RetryingClient, ScriptedTransport,
    SyncConfig, SyncEngine, SyncOptions, WorkRecord,
};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install metrics recorder (captures all metrics for OTEL export)
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt().with_target(false).compact().init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           catalog-sync: Basic Usage Example                   ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure backends and engines
    // ─────────────────────────────────────────────────────────────────────────
    let config = SyncConfig::from_env();
    println!("📦 Configuring catalog-sync...");

    let cache: Arc<dyn CacheStore> = match &config.redis_url {
        Some(url) => Arc::new(RedisCache::with_prefix(url, config.redis_prefix.as_deref()).await?),
        None => Arc::new(InMemoryCache::new()),
    };
    let sql_url = config.sql_url.clone().unwrap_or_else(|| "sqlite::memory:".into());
    let store = Arc::new(SqlDocumentStore::new(&sql_url).await?);
    println!("   └─ Store: {}", sql_url);

    // Scripted origin so the example needs no network
    let transport = Arc::new(ScriptedTransport::new(vec![
        Ok(OriginResponse::new("", 429).with_header("retry-after", "0")),
        Ok(OriginResponse::new("", 200).with_body(
            json!({"asin": "B000AP9A6K", "region": "us", "name": "Jane Author",
                   "genres": [{"asin": "18580606011", "name": "Mystery", "type": "Genres"}]})
            .to_string(),
        )),
        Ok(OriginResponse::new("", 200).with_body(
            json!({"asin": "B08G9PRS1K", "region": "us", "title": "A Quiet Case",
                   "authors": [{"asin": "B000AP9A6K", "name": "Jane Author"}]})
            .to_string(),
        )),
    ]));
    let origin = Arc::new(Origin::new(
        RetryingClient::new(transport.clone(), config.max_retries),
        Arc::new(CircuitBreaker::new("origin", config.circuit_config())),
    ));

    let record_cache = RecordCache::new(cache, config.cache_ttl());
    let authors = Arc::new(
        SyncEngine::<AuthorRecord>::new(
            record_cache.clone(),
            PersistentStore::new(store.clone()),
            Arc::new(JsonSourceFetcher::new(origin.clone(), |asin, region| {
                format!("https://api.example.{}/authors/{}", region.tld(), asin)
            })),
        )
        .with_recency_window(config.recency_window()),
    );
    let works = Arc::new(
        SyncEngine::<WorkRecord>::new(
            record_cache,
            PersistentStore::new(store),
            Arc::new(JsonSourceFetcher::new(origin.clone(), |asin, region| {
                format!("https://api.example.{}/works/{}", region.tld(), asin)
            })),
        )
        .with_recency_window(config.recency_window()),
    );

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Read-through
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📖 Reading through the tiers...");
    let author_id = Identity::new(EntityKind::Author, "b000ap9a6k", Region::Us)?;
    let work_id = Identity::new(EntityKind::Work, "B08G9PRS1K", Region::Us)?;

    for attempt in ["origin", "cache"] {
        let start = Instant::now();
        let author = authors.handler(&author_id, SyncOptions::READ).await?;
        println!(
            "   └─ {} → {:?} ({:?}, expected from {})",
            author_id,
            author.map(|a| a.name),
            start.elapsed(),
            attempt
        );
    }
    let work = works.handler(&work_id, SyncOptions::READ).await?;
    println!("   └─ {} → {:?}", work_id, work.map(|w| w.title));
    println!("   ⚡ Origin calls so far: {}", transport.calls());

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Refresh inside the recency window
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔄 Refreshing a record updated moments ago...");
    authors.handler(&author_id, SyncOptions::REFRESH).await?;
    println!("   └─ Origin calls: {} (unchanged)", transport.calls());

    // ─────────────────────────────────────────────────────────────────────────
    // 4. One refresh cycle
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🗓️  Running one refresh cycle ({})...", if config.parallel_scheduler_enabled { "parallel" } else { "paced" });
    let targets: Vec<Arc<dyn RefreshTarget>> = vec![works, authors];
    let scheduler = RefreshScheduler::new(
        targets,
        config.refresh_strategy()?,
        config.refresh_interval(),
        config.default_region,
    );
    if let Some(report) = scheduler.run_cycle().await {
        for phase in &report.phases {
            println!(
                "   └─ {}: {} total, {} ok, {} failed (rss {:?} → {:?})",
                phase.kind,
                phase.summary.total,
                phase.summary.success,
                phase.summary.failures,
                phase.memory_before.rss_bytes,
                phase.memory_after.rss_bytes
            );
        }
        println!("   ⏱️  Cycle took {:?}", report.elapsed);
    }

    let stats = origin.breaker().stats();
    println!("\n🔌 Origin circuit: {} ({} calls, {} rejected)", stats.state, stats.calls_total, stats.rejections);

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Dump raw metrics (OTEL-compatible)
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📈 Raw Metrics (OTEL export format):");
    dump_metrics(&snapshotter);

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

/// Dump all captured metrics in OTEL-compatible format
fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, value)| {
            let (_, key) = composite_key.into_parts();
            let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
            let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
            let rendered = match value {
                DebugValue::Counter(v) => v.to_string(),
                DebugValue::Gauge(v) => format!("{:.2}", v.into_inner()),
                DebugValue::Histogram(samples) => {
                    let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                    format!("count={} sum={:.4}", samples.len(), sum)
                }
            };
            format!("{}{} = {}", key.name(), label_str, rendered)
        })
        .collect();
    lines.sort();

    if lines.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
    for line in lines {
        println!("   └─ {}", line);
    }
}
