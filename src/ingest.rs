//! Ingestion pipeline - bounded queue, dedicated writer, batched transactions
//!
//! Stores command events in SQLite using a dedicated writer thread so the
//! shell-facing side never blocks on disk I/O.
//!
//! # Architecture
//!
//! ```text
//! Engine.record_event()
//!     │
//!     └──→ IngestPipeline.enqueue()          (non-blocking, drops on full)
//!             │
//!             └──→ std::sync::mpsc::SyncSender (bounded, default 500)
//!                     │
//!                     └──→ Dedicated Writer Thread
//!                             │
//!                             ├──→ Batch buffer (100 events or 40 ms)
//!                             └──→ One transaction per flush:
//!                                  events + FTS + templates + per-scope
//!                                  stats + transitions + recovery candidates
//! ```
//!
//! The writer remembers the last template it wrote per session, so Markov
//! transitions survive batch boundaries: the final command of batch N is
//! `prev` for the first command of batch N+1.

use crate::error::{EngineError, Result};
use crate::events::CommandEvent;
use crate::normalize::{self, Normalized};
use crate::scope;
use crate::stats::{self, ExitCodeClass};
use crate::store::Store;
use rusqlite::{params, Connection, TransactionBehavior};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// Configuration for the ingestion pipeline.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Queue capacity; new events are dropped when full.
    pub queue_capacity: usize,
    /// Maximum events per flush transaction.
    pub batch_size: usize,
    /// Flush interval when the batch does not fill up.
    pub flush_interval: Duration,
    /// Decay half-life shared with the scoring stores.
    pub half_life_ms: i64,
    /// Byte cap applied to `cmd_raw` before persisting.
    pub max_cmd_bytes: usize,
    /// Segments kept when deriving dir-scope keys.
    pub dir_scope_depth: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 500,
            batch_size: 100,
            flush_interval: Duration::from_millis(40),
            half_life_ms: stats::DEFAULT_HALF_LIFE_MS,
            max_cmd_bytes: 4096,
            dir_scope_depth: scope::DIR_SCOPE_MAX_DEPTH,
        }
    }
}

/// Metrics for observability of the pipeline itself.
#[derive(Debug, Default)]
pub struct IngestMetrics {
    /// Events successfully written.
    pub events_stored: AtomicU64,
    /// Events dropped because the queue was full.
    pub events_dropped: AtomicU64,
    /// Events that failed to write (semantic errors or dropped batches).
    pub events_store_failed: AtomicU64,
    /// Number of batch flushes.
    pub flush_count: AtomicU64,
    /// Batches that needed the single retry.
    pub batches_retried: AtomicU64,
    /// Batches dropped after the retry also failed.
    pub batches_dropped: AtomicU64,
    /// Total write latency in microseconds (for averaging).
    pub write_latency_us: AtomicU64,
}

impl IngestMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_stored: self.events_stored.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            events_store_failed: self.events_store_failed.load(Ordering::Relaxed),
            flush_count: self.flush_count.load(Ordering::Relaxed),
            batches_retried: self.batches_retried.load(Ordering::Relaxed),
            batches_dropped: self.batches_dropped.load(Ordering::Relaxed),
            avg_write_latency_us: {
                let total = self.write_latency_us.load(Ordering::Relaxed);
                let count = self.flush_count.load(Ordering::Relaxed);
                if count > 0 {
                    total / count
                } else {
                    0
                }
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub events_stored: u64,
    pub events_dropped: u64,
    pub events_store_failed: u64,
    pub flush_count: u64,
    pub batches_retried: u64,
    pub batches_dropped: u64,
    pub avg_write_latency_us: u64,
}

/// Commands sent to the writer thread.
pub(crate) enum WriterCommand {
    Store(Box<CommandEvent>),
    /// Request an immediate flush; the optional channel is signalled once
    /// the flush has committed.
    Flush(Option<SyncSender<()>>),
    Shutdown,
}

/// Signalled by the writer thread when it has fully drained and exited.
#[derive(Debug)]
struct CompletionSignal {
    done: Mutex<bool>,
    condvar: Condvar,
}

impl CompletionSignal {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn complete(&self) {
        if let Ok(mut done) = self.done.lock() {
            *done = true;
            self.condvar.notify_all();
        }
    }

    fn wait(&self, timeout: Duration) -> bool {
        let Ok(guard) = self.done.lock() else {
            return false;
        };
        let (guard, _) = match self
            .condvar
            .wait_timeout_while(guard, timeout, |done| !*done)
        {
            Ok(r) => r,
            Err(_) => return false,
        };
        *guard
    }
}

/// The last command the writer persisted for a session. Survives batch
/// boundaries; feeds transitions and recovery candidates.
#[derive(Debug, Clone)]
struct PrevCommand {
    template_id: String,
    exit_code: i32,
    ts_ms: i64,
}

/// Bounded, back-pressured ingestion pipeline with a dedicated writer
/// thread (never a tokio task: SQLite work must not stall the runtime).
#[derive(Debug)]
pub struct IngestPipeline {
    tx: SyncSender<WriterCommand>,
    writer_handle: Option<JoinHandle<()>>,
    completion: Arc<CompletionSignal>,
    metrics: Arc<IngestMetrics>,
    config: IngestConfig,
}

impl IngestPipeline {
    /// Spawn the writer thread against the shared store.
    pub fn new(store: Arc<Store>, config: IngestConfig) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel::<WriterCommand>(config.queue_capacity);
        let metrics = Arc::new(IngestMetrics::default());
        let completion = Arc::new(CompletionSignal::new());

        let writer_metrics = Arc::clone(&metrics);
        let writer_completion = Arc::clone(&completion);
        let writer_config = config.clone();

        let writer_handle = thread::Builder::new()
            .name("clai-writer".into())
            .spawn(move || {
                writer_thread(rx, store, writer_config, writer_metrics);
                writer_completion.complete();
            })
            .map_err(|e| EngineError::Fatal(format!("cannot spawn writer thread: {e}")))?;

        Ok(Self {
            tx,
            writer_handle: Some(writer_handle),
            completion,
            metrics,
            config,
        })
    }

    /// Pipeline with no writer thread: events stay queued. Used to test
    /// queue accounting without a live store.
    #[cfg(test)]
    pub(crate) fn new_stalled(
        config: IngestConfig,
    ) -> (Self, mpsc::Receiver<WriterCommand>) {
        let (tx, rx) = mpsc::sync_channel::<WriterCommand>(config.queue_capacity);
        (
            Self {
                tx,
                writer_handle: None,
                completion: Arc::new(CompletionSignal::new()),
                metrics: Arc::new(IngestMetrics::default()),
                config,
            },
            rx,
        )
    }

    /// Offer an event to the queue. Never blocks; returns whether the event
    /// was accepted. Ephemeral events are acknowledged but never queued.
    pub fn enqueue(&self, event: CommandEvent) -> bool {
        if event.ephemeral {
            trace!("ephemeral event acknowledged, not persisted");
            return true;
        }
        match self.tx.try_send(WriterCommand::Store(Box::new(event))) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = self.metrics.events_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!("ingest queue full: dropped event (total dropped: {dropped})");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                error!("ingest writer thread disconnected");
                false
            }
        }
    }

    /// Request an immediate batch write. Fire-and-forget.
    pub fn flush(&self) {
        let _ = self.tx.try_send(WriterCommand::Flush(None));
    }

    /// Request a flush and wait until it has committed.
    pub fn flush_sync(&self, timeout: Duration) -> bool {
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        if self.tx.send(WriterCommand::Flush(Some(ack_tx))).is_err() {
            return false;
        }
        ack_rx.recv_timeout(timeout).is_ok()
    }

    pub fn metrics(&self) -> &Arc<IngestMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Signal shutdown, wait for the writer to drain the queue fully and
    /// join it. Idempotent.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.writer_handle.take() else {
            return;
        };
        let _ = self.tx.send(WriterCommand::Shutdown);

        const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
        if !self.completion.wait(SHUTDOWN_TIMEOUT) {
            warn!(
                "ingest writer did not complete within {:?}",
                SHUTDOWN_TIMEOUT
            );
        }
        let _ = handle.join();
    }
}

impl Drop for IngestPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Dedicated writer thread: consume the queue, accumulate batches, flush.
fn writer_thread(
    rx: mpsc::Receiver<WriterCommand>,
    store: Arc<Store>,
    config: IngestConfig,
    metrics: Arc<IngestMetrics>,
) {
    let mut batch: Vec<CommandEvent> = Vec::with_capacity(config.batch_size);
    let mut last_flush = Instant::now();
    let mut prev_by_session: HashMap<String, PrevCommand> = HashMap::new();
    let mut repo_roots: HashMap<String, Option<PathBuf>> = HashMap::new();

    loop {
        match rx.recv_timeout(config.flush_interval) {
            Ok(WriterCommand::Store(event)) => {
                batch.push(*event);
                if batch.len() >= config.batch_size {
                    flush_batch(&store, &mut batch, &mut prev_by_session, &mut repo_roots, &config, &metrics);
                    last_flush = Instant::now();
                }
            }
            Ok(WriterCommand::Flush(ack)) => {
                flush_batch(&store, &mut batch, &mut prev_by_session, &mut repo_roots, &config, &metrics);
                last_flush = Instant::now();
                if let Some(ack) = ack {
                    let _ = ack.try_send(());
                }
            }
            Ok(WriterCommand::Shutdown) => {
                // Drain whatever is still queued before exiting.
                while let Ok(cmd) = rx.try_recv() {
                    match cmd {
                        WriterCommand::Store(event) => {
                            batch.push(*event);
                            if batch.len() >= config.batch_size {
                                flush_batch(&store, &mut batch, &mut prev_by_session, &mut repo_roots, &config, &metrics);
                            }
                        }
                        WriterCommand::Flush(Some(ack)) => {
                            let _ = ack.try_send(());
                        }
                        _ => {}
                    }
                }
                flush_batch(&store, &mut batch, &mut prev_by_session, &mut repo_roots, &config, &metrics);
                debug!("ingest writer shutting down");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                if !batch.is_empty() && last_flush.elapsed() >= config.flush_interval {
                    flush_batch(&store, &mut batch, &mut prev_by_session, &mut repo_roots, &config, &metrics);
                    last_flush = Instant::now();
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                flush_batch(&store, &mut batch, &mut prev_by_session, &mut repo_roots, &config, &metrics);
                break;
            }
        }
    }
}

struct BatchOutcome {
    stored: u64,
    failed: u64,
    prev_updates: HashMap<String, PrevCommand>,
}

/// Flush the batch in a single transaction, retrying once on transactional
/// failure. The per-session `prev` state only advances on commit.
fn flush_batch(
    store: &Store,
    batch: &mut Vec<CommandEvent>,
    prev_by_session: &mut HashMap<String, PrevCommand>,
    repo_roots: &mut HashMap<String, Option<PathBuf>>,
    config: &IngestConfig,
    metrics: &IngestMetrics,
) {
    if batch.is_empty() {
        return;
    }
    let start = Instant::now();
    let count = batch.len() as u64;

    let mut outcome = write_batch(store, batch, prev_by_session, repo_roots, config);
    if let Err(e) = &outcome {
        if !e.is_semantic() {
            warn!("batch write failed, retrying once: {e}");
            metrics.batches_retried.fetch_add(1, Ordering::Relaxed);
            outcome = write_batch(store, batch, prev_by_session, repo_roots, config);
        }
    }

    match outcome {
        Ok(result) => {
            prev_by_session.extend(result.prev_updates);
            metrics
                .events_stored
                .fetch_add(result.stored, Ordering::Relaxed);
            if result.failed > 0 {
                metrics
                    .events_store_failed
                    .fetch_add(result.failed, Ordering::Relaxed);
            }
            trace!(
                "flushed {} events ({} skipped) in {}us",
                result.stored,
                result.failed,
                start.elapsed().as_micros()
            );
        }
        Err(e) => {
            error!("dropping batch of {count} events after retry: {e}");
            metrics.batches_dropped.fetch_add(1, Ordering::Relaxed);
            metrics
                .events_store_failed
                .fetch_add(count, Ordering::Relaxed);
        }
    }

    metrics
        .write_latency_us
        .fetch_add(start.elapsed().as_micros() as u64, Ordering::Relaxed);
    metrics.flush_count.fetch_add(1, Ordering::Relaxed);
    batch.clear();
}

/// Write the whole batch inside one immediate transaction.
///
/// Semantic errors skip the single event; anything else aborts (and rolls
/// back) the batch for the caller to retry.
fn write_batch(
    store: &Store,
    batch: &[CommandEvent],
    prev_by_session: &HashMap<String, PrevCommand>,
    repo_roots: &mut HashMap<String, Option<PathBuf>>,
    config: &IngestConfig,
) -> Result<BatchOutcome> {
    store.with_conn_mut(|conn| {
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(EngineError::from)?;

        let mut pending_prev: HashMap<String, PrevCommand> = HashMap::new();
        let mut stored = 0u64;
        let mut failed = 0u64;

        for event in batch {
            let result = {
                let prev = pending_prev
                    .get(&event.session_id)
                    .or_else(|| prev_by_session.get(&event.session_id));
                write_event(&tx, event, prev, repo_roots, config)
            };
            match result {
                Ok(written) => {
                    stored += 1;
                    pending_prev.insert(event.session_id.clone(), written);
                }
                Err(e) if e.is_semantic() => {
                    warn!(
                        "skipping malformed event (session {}): {e}",
                        event.session_id
                    );
                    failed += 1;
                }
                Err(e) => return Err(e),
            }
        }

        tx.commit().map_err(EngineError::from)?;
        Ok(BatchOutcome {
            stored,
            failed,
            prev_updates: pending_prev,
        })
    })
}

/// Write one event and its derived rows. Runs inside the batch transaction.
fn write_event(
    conn: &Connection,
    event: &CommandEvent,
    prev: Option<&PrevCommand>,
    repo_roots: &mut HashMap<String, Option<PathBuf>>,
    config: &IngestConfig,
) -> Result<PrevCommand> {
    let norm = normalize::normalize(&event.cmd_raw);
    // Per-session timestamps are monotone non-decreasing; a hook reporting
    // out of order is clamped rather than rejected.
    let ts = match prev {
        Some(p) => event.ts_ms.max(p.ts_ms),
        None => event.ts_ms,
    };

    conn.prepare_cached(
        "INSERT OR IGNORE INTO sessions (id, shell, started_at_ms) VALUES (?1, ?2, ?3)",
    )?
    .execute(params![event.session_id, event.shell.as_str(), ts])?;

    conn.prepare_cached(
        "INSERT INTO command_events
         (session_id, ts_ms, cwd, repo_key, branch, cmd_raw, cmd_norm, truncated,
          template_id, exit_code, duration_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
    )?
    .execute(params![
        event.session_id,
        ts,
        event.cwd,
        event.repo_key,
        event.branch,
        event.cmd_raw,
        norm.cmd_norm,
        event.truncated as i64,
        norm.template_id,
        event.exit_code,
        event.duration_ms.map(|d| d as i64),
    ])?;
    let rowid = conn.last_insert_rowid();

    conn.prepare_cached("INSERT INTO command_fts (rowid, cmd_raw) VALUES (?1, ?2)")?
        .execute(params![rowid, event.cmd_raw])?;

    upsert_template(conn, &norm, ts)?;

    let dir_hash = dir_hash_for(&event.cwd, repo_roots, config.dir_scope_depth);
    let scopes = scope::scopes_for(
        &event.session_id,
        event.repo_key.as_deref(),
        dir_hash.as_deref(),
    );

    let success = event.exit_code == 0;
    for s in &scopes {
        upsert_stat(conn, &s.key(), &norm.template_id, ts, success, config.half_life_ms)?;
    }

    if let Some(prev) = prev {
        for s in &scopes {
            upsert_transition(
                conn,
                &s.key(),
                &prev.template_id,
                &norm.template_id,
                ts,
                config.half_life_ms,
            )?;
        }
        if prev.exit_code != 0 && success {
            let class = ExitCodeClass::from_code(prev.exit_code);
            for s in &scopes {
                upsert_recovery(
                    conn,
                    &s.key(),
                    &prev.template_id,
                    class,
                    &norm.template_id,
                    ts,
                    config.half_life_ms,
                )?;
            }
        }
    }

    Ok(PrevCommand {
        template_id: norm.template_id,
        exit_code: event.exit_code,
        ts_ms: ts,
    })
}

fn upsert_template(conn: &Connection, norm: &Normalized, ts: i64) -> Result<()> {
    conn.prepare_cached(
        "INSERT INTO command_templates
         (template_id, cmd_norm, slot_count, first_seen_ms, last_seen_ms)
         VALUES (?1, ?2, ?3, ?4, ?4)
         ON CONFLICT(template_id)
         DO UPDATE SET last_seen_ms = MAX(last_seen_ms, excluded.last_seen_ms)",
    )?
    .execute(params![norm.template_id, norm.cmd_norm, norm.slot_count, ts])?;
    Ok(())
}

/// Apply the decayed-increment update to one (scope, template) stat row.
fn upsert_stat(
    conn: &Connection,
    scope_key: &str,
    template_id: &str,
    ts: i64,
    success: bool,
    half_life_ms: i64,
) -> Result<()> {
    let existing = optional_row(
        conn.prepare_cached(
            "SELECT score, success_count, failure_count, last_seen_ms
             FROM command_stats WHERE scope = ?1 AND template_id = ?2",
        )?
        .query_row(params![scope_key, template_id], |row| {
            Ok((
                row.get::<_, f64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        }),
    )?;

    let (old_score, successes, failures, last_seen) = existing.unwrap_or((0.0, 0, 0, ts));
    let score = stats::decayed_increment(old_score, last_seen, ts, half_life_ms);
    let (successes, failures) = if success {
        (successes + 1, failures)
    } else {
        (successes, failures + 1)
    };

    conn.prepare_cached(
        "INSERT OR REPLACE INTO command_stats
         (scope, template_id, score, success_count, failure_count, last_seen_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?
    .execute(params![
        scope_key,
        template_id,
        score,
        successes,
        failures,
        ts.max(last_seen),
    ])?;
    Ok(())
}

fn upsert_transition(
    conn: &Connection,
    scope_key: &str,
    prev_template_id: &str,
    next_template_id: &str,
    ts: i64,
    half_life_ms: i64,
) -> Result<()> {
    let existing = optional_row(
        conn.prepare_cached(
            "SELECT weight, count, last_seen_ms FROM transitions
             WHERE scope = ?1 AND prev_template_id = ?2 AND next_template_id = ?3",
        )?
        .query_row(params![scope_key, prev_template_id, next_template_id], |row| {
            Ok((
                row.get::<_, f64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        }),
    )?;

    let (old_weight, count, last_seen) = existing.unwrap_or((0.0, 0, ts));
    let weight = stats::decayed_increment(old_weight, last_seen, ts, half_life_ms);

    conn.prepare_cached(
        "INSERT OR REPLACE INTO transitions
         (scope, prev_template_id, next_template_id, weight, count, last_seen_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?
    .execute(params![
        scope_key,
        prev_template_id,
        next_template_id,
        weight,
        count + 1,
        ts.max(last_seen),
    ])?;
    Ok(())
}

/// Record that `recovery_template_id` fixed a failure of
/// `failed_template_id`. Rows exist only for observed successful
/// recoveries; `success_rate` is the Laplace-smoothed confidence in the
/// pairing, approaching 1.0 as observations accumulate.
fn upsert_recovery(
    conn: &Connection,
    scope_key: &str,
    failed_template_id: &str,
    class: ExitCodeClass,
    recovery_template_id: &str,
    ts: i64,
    half_life_ms: i64,
) -> Result<()> {
    let existing = optional_row(
        conn.prepare_cached(
            "SELECT weight, count, last_seen_ms FROM recovery_candidates
             WHERE scope = ?1 AND failed_template_id = ?2
               AND exit_code_class = ?3 AND recovery_template_id = ?4",
        )?
        .query_row(
            params![scope_key, failed_template_id, class.as_str(), recovery_template_id],
            |row| {
                Ok((
                    row.get::<_, f64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        ),
    )?;

    let (old_weight, count, last_seen) = existing.unwrap_or((0.0, 0, ts));
    let weight = stats::decayed_increment(old_weight, last_seen, ts, half_life_ms);
    let count = count + 1;
    let success_rate = stats::success_ratio(count, 0);

    conn.prepare_cached(
        "INSERT OR REPLACE INTO recovery_candidates
         (scope, failed_template_id, exit_code_class, recovery_template_id,
          weight, count, success_rate, last_seen_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?
    .execute(params![
        scope_key,
        failed_template_id,
        class.as_str(),
        recovery_template_id,
        weight,
        count,
        success_rate,
        ts.max(last_seen),
    ])?;
    Ok(())
}

/// Dir-scope hash for a working directory, with a per-writer repo-root
/// cache so the filesystem walk happens once per cwd.
fn dir_hash_for(
    cwd: &str,
    repo_roots: &mut HashMap<String, Option<PathBuf>>,
    max_depth: usize,
) -> Option<String> {
    let path = Path::new(cwd);
    let root = repo_roots
        .entry(cwd.to_string())
        .or_insert_with(|| scope::find_repo_root(path))
        .clone()?;
    scope::dir_key(path, &root, max_depth)
}

fn optional_row<T>(result: rusqlite::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}
