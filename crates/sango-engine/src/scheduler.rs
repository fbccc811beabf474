//! Background tasks: flush, merge, index build, cache metrics, GC.
//!
//! Each task runs on its own interval and swallows every per-item error
//! after logging it; a failing table or segment is retried with exponential
//! backoff instead of wedging the tick. Destructive work (merge, index
//! build) holds the table's work lease so it never collides with DDL or
//! with another scheduler worker on the same table.

use crate::engine::EngineCore;
use sango_wal::Wal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Per-item retry damper.
struct Backoff {
    items: HashMap<String, (u32, Instant)>,
}

impl Backoff {
    fn new() -> Self {
        Self {
            items: HashMap::new(),
        }
    }

    fn ready(&self, key: &str) -> bool {
        self.items
            .get(key)
            .map(|(_, next)| Instant::now() >= *next)
            .unwrap_or(true)
    }

    fn failure(&mut self, key: &str) {
        let entry = self.items.entry(key.to_string()).or_insert((0, Instant::now()));
        entry.0 = entry.0.saturating_add(1);
        let delay = BACKOFF_BASE
            .saturating_mul(1u32 << entry.0.min(7))
            .min(BACKOFF_CAP);
        entry.1 = Instant::now() + delay;
    }

    fn success(&mut self, key: &str) {
        self.items.remove(key);
    }
}

pub(crate) struct SchedulerHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Signals every task and waits for them to drain.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        info!("background scheduler stopped");
    }
}

pub(crate) fn spawn(core: Arc<EngineCore>, wal: Arc<Wal>) -> SchedulerHandle {
    let cancel = CancellationToken::new();
    let tasks = vec![
        tokio::spawn(flush_loop(core.clone(), wal.clone(), cancel.clone())),
        tokio::spawn(merge_loop(core.clone(), cancel.clone())),
        tokio::spawn(index_loop(core.clone(), cancel.clone())),
        tokio::spawn(cache_loop(core.clone(), cancel.clone())),
        tokio::spawn(gc_loop(core, cancel.clone())),
    ];
    SchedulerHandle { cancel, tasks }
}

macro_rules! tick_or_return {
    ($interval:expr, $cancel:expr) => {
        tokio::select! {
            _ = $cancel.cancelled() => return,
            _ = $interval.tick() => {}
        }
    };
}

async fn flush_loop(core: Arc<EngineCore>, wal: Arc<Wal>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(core.config.flush_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick_or_return!(interval, cancel);
        for buffer in core.buffers.take_aged(core.config.flush_interval) {
            let table = buffer.table.clone();
            let partition = buffer.partition.clone();
            if let Err(err) = core.flush_buffer(&wal, buffer).await {
                error!(%table, %partition, %err, "periodic flush failed");
            }
        }
    }
}

async fn merge_loop(core: Arc<EngineCore>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(core.config.merge_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut backoff = Backoff::new();
    loop {
        tick_or_return!(interval, cancel);
        let tables = match core.catalog.all_tables() {
            Ok(tables) => tables,
            Err(err) => {
                error!(%err, "merge tick could not list tables");
                continue;
            }
        };
        for schema in tables {
            if !backoff.ready(&schema.name) {
                continue;
            }
            let lease = core.table_lease(&schema.name);
            let _guard = lease.lock().await;
            match core.merge_table(&schema.name).await {
                Ok(0) => backoff.success(&schema.name),
                Ok(merged) => {
                    debug!(table = %schema.name, merged, "merge tick combined segments");
                    backoff.success(&schema.name);
                }
                Err(err) => {
                    error!(table = %schema.name, %err, "merge failed");
                    backoff.failure(&schema.name);
                }
            }
        }
    }
}

async fn index_loop(core: Arc<EngineCore>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(core.config.index_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut backoff = Backoff::new();
    loop {
        tick_or_return!(interval, cancel);
        let tables = match core.catalog.all_tables() {
            Ok(tables) => tables,
            Err(err) => {
                error!(%err, "index tick could not list tables");
                continue;
            }
        };
        for schema in tables {
            if schema.index.is_none() || !backoff.ready(&schema.name) {
                continue;
            }
            let lease = core.table_lease(&schema.name);
            let _guard = lease.lock().await;
            match core.build_table_index(&schema.name).await {
                Ok(0) => backoff.success(&schema.name),
                Ok(built) => {
                    debug!(table = %schema.name, built, "index tick built segments");
                    backoff.success(&schema.name);
                }
                Err(err) => {
                    error!(table = %schema.name, %err, "index build failed");
                    backoff.failure(&schema.name);
                }
            }
        }
    }
}

async fn cache_loop(core: Arc<EngineCore>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(core.config.cache_metrics_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick_or_return!(interval, cancel);
        let (bytes, entries) = core.cache.usage();
        let capacity = core.cache.capacity();
        debug!(bytes, entries, capacity, "block cache usage");
        let watermark = (capacity as f64 * core.config.cache_watermark) as u64;
        if bytes > watermark {
            core.cache.evict_to(watermark);
            let (after, _) = core.cache.usage();
            info!(before = bytes, after, watermark, "cache evicted to watermark");
        }
    }
}

async fn gc_loop(core: Arc<EngineCore>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(core.config.gc_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick_or_return!(interval, cancel);
        match core.gc_segments() {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "gc tick removed segment directories"),
            Err(err) => error!(%err, "gc tick failed"),
        }
    }
}
