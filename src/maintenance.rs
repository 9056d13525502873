//! Maintenance loop - checkpoints, retention pruning, FTS upkeep, vacuum
//!
//! One tokio task on a slow ticker keeps the store inside its disk budget
//! without ever monopolizing the writer connection: retention pruning runs
//! in small delete batches with a yield in between, and the heavy
//! operations (FTS optimize, VACUUM) only run on quiet ticks.

use crate::error::Result;
use crate::ingest::IngestMetrics;
use crate::sessions::SessionRegistry;
use crate::store::{CheckpointMode, Store};
use rusqlite::params;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Maintenance tuning knobs.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Tick interval.
    pub interval: Duration,
    /// Events older than this many days are pruned; 0 disables retention.
    pub retention_days: u32,
    /// A tick with fewer new events than this counts as low activity.
    pub low_activity_threshold: u64,
    /// Rows deleted per prune batch.
    pub prune_batch: usize,
    /// Yield between prune batches so the writer connection stays shared.
    pub prune_yield: Duration,
    /// Vacuum when the file grew by at least this factor since last vacuum.
    pub vacuum_growth: f64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            retention_days: 90,
            low_activity_threshold: 5,
            prune_batch: 1000,
            prune_yield: Duration::from_millis(100),
            vacuum_growth: 2.0,
        }
    }
}

/// Run the maintenance loop until the shutdown signal fires.
pub async fn run(
    store: Arc<Store>,
    metrics: Arc<IngestMetrics>,
    sessions: Arc<SessionRegistry>,
    config: MaintenanceConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so startup stays cheap.
    ticker.tick().await;

    let mut last_events = metrics.events_stored.load(Ordering::Relaxed);
    let mut last_vacuum_size = store.file_size();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let events_now = metrics.events_stored.load(Ordering::Relaxed);
                let delta = events_now.saturating_sub(last_events);
                last_events = events_now;
                let low_activity = delta < config.low_activity_threshold;

                tick(
                    &store,
                    &sessions,
                    &config,
                    low_activity,
                    &mut last_vacuum_size,
                    &mut shutdown,
                )
                .await;
            }
        }
    }
    debug!("maintenance loop stopped");
}

async fn tick(
    store: &Arc<Store>,
    sessions: &Arc<SessionRegistry>,
    config: &MaintenanceConfig,
    low_activity: bool,
    last_vacuum_size: &mut u64,
    shutdown: &mut watch::Receiver<bool>,
) {
    // 1. WAL checkpoint: truncate when quiet, passive otherwise.
    let mode = if low_activity {
        CheckpointMode::Truncate
    } else {
        CheckpointMode::Passive
    };
    if let Err(e) = run_blocking(store, move |s| s.checkpoint(mode)).await {
        warn!("maintenance checkpoint failed: {e}");
    }

    // 2. Retention prune in batches, yielding between them.
    if config.retention_days > 0 {
        let cutoff_ms =
            chrono::Utc::now().timestamp_millis() - i64::from(config.retention_days) * 86_400_000;
        let mut total = 0usize;
        loop {
            let batch = config.prune_batch;
            let deleted = match run_blocking(store, move |s| prune_batch(s, cutoff_ms, batch)).await
            {
                Ok(n) => n,
                Err(e) => {
                    warn!("retention prune failed: {e}");
                    break;
                }
            };
            total += deleted;
            if deleted < config.prune_batch {
                break;
            }
            // Give the writer connection back before the next batch; bail
            // out promptly when shutdown fires mid-prune.
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(config.prune_yield) => {}
            }
        }
        if total > 0 {
            info!("retention prune removed {total} events older than {cutoff_ms}");
            match run_blocking(store, collect_orphan_templates).await {
                Ok(n) if n > 0 => debug!("garbage-collected {n} orphaned templates"),
                Ok(_) => {}
                Err(e) => warn!("template gc failed: {e}"),
            }
        }
    }

    // 3. Heavier work only when the store is quiet.
    if low_activity {
        if let Err(e) = run_blocking(store, optimize_fts).await {
            warn!("fts optimize failed: {e}");
        }

        let size = store.file_size();
        if *last_vacuum_size > 0 && size as f64 >= config.vacuum_growth * *last_vacuum_size as f64 {
            info!(
                "vacuuming store ({} -> grew past {:.1}x)",
                size, config.vacuum_growth
            );
            match run_blocking(store, vacuum).await {
                Ok(()) => *last_vacuum_size = store.file_size(),
                Err(e) => warn!("vacuum failed: {e}"),
            }
        } else if *last_vacuum_size == 0 {
            *last_vacuum_size = size;
        }
    }

    // 4. Sweep idle in-memory session state while we are here.
    sessions.evict_idle(chrono::Utc::now().timestamp_millis());
}

async fn run_blocking<T: Send + 'static>(
    store: &Arc<Store>,
    f: impl FnOnce(&Store) -> Result<T> + Send + 'static,
) -> Result<T> {
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| crate::error::EngineError::Fatal(format!("maintenance task: {e}")))?
}

/// Delete one batch of expired events (FTS rows first, same id set), never
/// touching a row with `ts_ms >= cutoff_ms`. Returns rows deleted.
pub(crate) fn prune_batch(store: &Store, cutoff_ms: i64, limit: usize) -> Result<usize> {
    store.with_conn_mut(|conn| {
        let tx = conn.transaction().map_err(crate::error::EngineError::from)?;
        // External-content FTS: the index entry must go before the base
        // row, or searches return ghost rowids.
        tx.prepare_cached(
            "DELETE FROM command_fts WHERE rowid IN (
                 SELECT id FROM command_events WHERE ts_ms < ?1 ORDER BY id LIMIT ?2
             )",
        )?
        .execute(params![cutoff_ms, limit as i64])?;
        let deleted = tx
            .prepare_cached(
                "DELETE FROM command_events WHERE id IN (
                     SELECT id FROM command_events WHERE ts_ms < ?1 ORDER BY id LIMIT ?2
                 )",
            )?
            .execute(params![cutoff_ms, limit as i64])?;
        tx.commit().map_err(crate::error::EngineError::from)?;
        Ok(deleted)
    })
}

/// Remove templates no longer referenced by any event.
pub(crate) fn collect_orphan_templates(store: &Store) -> Result<usize> {
    store.execute(
        "gc_templates",
        "DELETE FROM command_templates WHERE NOT EXISTS (
             SELECT 1 FROM command_events e WHERE e.template_id = command_templates.template_id
         )",
        [],
    )
}

fn optimize_fts(store: &Store) -> Result<()> {
    store.execute(
        "fts_optimize",
        "INSERT INTO command_fts (command_fts) VALUES ('optimize')",
        [],
    )?;
    Ok(())
}

fn vacuum(store: &Store) -> Result<()> {
    store.with_conn(|conn| {
        conn.execute("VACUUM", [])
            .map_err(crate::error::EngineError::from)?;
        Ok(())
    })
}
