//! Engine - the single handle wiring every subsystem together
//!
//! The outermost caller constructs one `Engine` and passes it down; nothing
//! in the crate reaches for process-wide state. The engine owns the store,
//! the ingestion pipeline, the ranker's read pool, the per-session
//! in-memory registry and the background workers, and tears them all down
//! in order on shutdown.

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::events::CommandEvent;
use crate::ingest::{IngestPipeline, MetricsSnapshot};
use crate::maintenance;
use crate::normalize;
use crate::rank::{RankRequest, Ranker, Suggestion};
use crate::sessions::{KeystrokeOutcome, SessionRegistry};
use crate::store::{self, Store};
use crate::workflow::{NextStepCandidate, WorkflowPattern};
use crate::cadence::TimingHint;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Everything a suggestion request produces: the ranked list, next-step
/// workflow candidates, and the cadence hint for the shell.
#[derive(Debug)]
pub struct SuggestResponse {
    pub suggestions: Vec<Suggestion>,
    pub workflow: Vec<NextStepCandidate>,
    pub hint: TimingHint,
}

/// The suggestion engine. Construct with [`Engine::open`], drive from the
/// shell hook and the interactive caller, and finish with
/// [`Engine::shutdown`].
#[derive(Debug)]
pub struct Engine {
    config: Config,
    store: Arc<Store>,
    pipeline: IngestPipeline,
    ranker: Ranker,
    sessions: Arc<SessionRegistry>,
    shutdown_tx: watch::Sender<bool>,
    maintenance_task: Option<JoinHandle<()>>,
    checkpoint_task: Option<JoinHandle<()>>,
}

impl Engine {
    /// Open the store (recovering if corrupt and enabled), load workflow
    /// patterns, start the writer thread and - when a tokio runtime is
    /// available - the background maintenance and checkpoint workers.
    pub fn open(config: Config) -> Result<Self> {
        let db_path = config.db_path();
        let store = Arc::new(Store::open(&db_path, config.store_options())?);

        let patterns = load_workflow_patterns(&store)?;
        info!("loaded {} workflow patterns", patterns.len());
        let sessions = Arc::new(SessionRegistry::new(
            patterns.into(),
            config.cadence_config(),
            config.workflow_config(),
            config.session_idle_ms,
        ));

        let pipeline = IngestPipeline::new(Arc::clone(&store), config.ingest_config())?;
        let ranker = Ranker::new(&db_path, config.rank_config())?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (maintenance_task, checkpoint_task) =
            if tokio::runtime::Handle::try_current().is_ok() {
                let metrics = Arc::clone(pipeline.metrics());
                let maintenance_task = tokio::spawn(maintenance::run(
                    Arc::clone(&store),
                    Arc::clone(&metrics),
                    Arc::clone(&sessions),
                    config.maintenance_config(),
                    shutdown_rx.clone(),
                ));
                let counter = Arc::clone(&metrics);
                let checkpoint_task = store::spawn_checkpoint_task(
                    Arc::clone(&store),
                    Duration::from_secs(300),
                    move || counter.events_stored.load(Ordering::Relaxed),
                    config.maintenance_config().low_activity_threshold,
                    shutdown_rx,
                );
                (Some(maintenance_task), Some(checkpoint_task))
            } else {
                warn!("no tokio runtime: background maintenance disabled");
                (None, None)
            };

        Ok(Self {
            config,
            store,
            pipeline,
            ranker,
            sessions,
            shutdown_tx,
            maintenance_task,
            checkpoint_task,
        })
    }

    /// Observe one executed command: validate, sanitize, update in-memory
    /// session state, enqueue for persistence.
    ///
    /// Returns whether the event was accepted by the queue (ephemeral
    /// events are accepted without being persisted). A full queue is not an
    /// error - the drop is counted and the caller stays fast.
    pub fn record_event(&self, mut event: CommandEvent) -> Result<bool> {
        event.validate()?;
        event.sanitize(self.config.ingest.max_cmd_bytes);

        // Workflow context advances even for ephemeral events; they are
        // session context, just never disk state.
        let norm = normalize::normalize(&event.cmd_raw);
        self.sessions
            .on_command(&event.session_id, &norm.template_id, event.ts_ms);

        Ok(self.pipeline.enqueue(event))
    }

    /// Produce ranked suggestions plus workflow candidates and the cadence
    /// hint for one session.
    pub async fn suggest(&self, mut req: RankRequest) -> SuggestResponse {
        if req.max_results == 0 {
            req.max_results = self.config.rank.max_results;
        }
        let hint = self.sessions.timing_hint(&req.session_id, req.now_ms);
        let workflow = self.sessions.workflow_candidates(&req.session_id);
        let suggestions = self.ranker.rank(req).await;
        SuggestResponse {
            suggestions,
            workflow,
            hint,
        }
    }

    /// Feed a keystroke through the session's cadence machine.
    pub fn on_keystroke(&self, session_id: &str, now_ms: i64) -> KeystrokeOutcome {
        self.sessions.on_keystroke(session_id, now_ms)
    }

    /// Timer-driven idle sweep for one session.
    pub fn on_idle(&self, session_id: &str, now_ms: i64) {
        self.sessions.on_idle(session_id, now_ms);
    }

    /// Release a session's in-memory state.
    pub fn end_session(&self, session_id: &str) {
        self.sessions.end_session(session_id);
    }

    /// Request an immediate batch write.
    pub fn flush(&self) {
        self.pipeline.flush();
    }

    /// Request a flush and wait for it to commit.
    pub fn flush_sync(&self, timeout: Duration) -> bool {
        self.pipeline.flush_sync(timeout)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.pipeline.metrics().snapshot()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Hot-swap the workflow pattern set (after an offline mining pass).
    pub fn set_workflow_patterns(&self, patterns: Vec<WorkflowPattern>) {
        self.sessions.set_patterns(patterns.into());
    }

    /// Reload workflow patterns from the store. Returns how many loaded.
    pub fn reload_workflow_patterns(&self) -> Result<usize> {
        let patterns = load_workflow_patterns(&self.store)?;
        let count = patterns.len();
        self.sessions.set_patterns(patterns.into());
        Ok(count)
    }

    /// Run an integrity check; on failure, rotate and re-open when recovery
    /// is enabled, otherwise surface the corruption.
    pub fn check_integrity(&self) -> Result<()> {
        match self.store.run_integrity_check() {
            Ok(()) => Ok(()),
            Err(e) if e.is_corrupt() && self.config.recovery.enabled => {
                warn!("integrity check failed, rotating store: {e}");
                self.store.recover(&e.to_string())
            }
            Err(e) => Err(e),
        }
    }

    /// Drain the pipeline, stop the background workers and close the store.
    pub async fn shutdown(mut self) {
        info!("engine shutting down");
        let _ = self.shutdown_tx.send(true);
        self.pipeline.shutdown();
        if let Some(task) = self.maintenance_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.checkpoint_task.take() {
            let _ = task.await;
        }
        self.store.close();
    }
}

/// Load the offline-mined workflow patterns from the store. Malformed rows
/// are skipped with a warning rather than failing startup.
fn load_workflow_patterns(store: &Store) -> Result<Vec<WorkflowPattern>> {
    store.with_conn(|conn| {
        let mut stmt = conn
            .prepare_cached(
                "SELECT pattern_id, template_ids, display_names, step_count,
                        occurrence_count, avg_duration_ms
                 FROM workflow_patterns ORDER BY occurrence_count DESC",
            )
            .map_err(EngineError::from)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                ))
            })
            .map_err(EngineError::from)?;

        let mut patterns = Vec::new();
        for row in rows {
            let (pattern_id, template_ids, display_names, step_count, occurrences, avg) =
                row.map_err(EngineError::from)?;
            let template_ids: Vec<String> = match serde_json::from_str(&template_ids) {
                Ok(ids) => ids,
                Err(e) => {
                    warn!("skipping workflow pattern {pattern_id}: bad template_ids: {e}");
                    continue;
                }
            };
            let display_names: Vec<String> =
                serde_json::from_str(&display_names).unwrap_or_else(|_| template_ids.clone());
            if template_ids.len() < 2 {
                warn!("skipping workflow pattern {pattern_id}: fewer than two steps");
                continue;
            }
            patterns.push(WorkflowPattern {
                pattern_id,
                step_count: step_count.max(template_ids.len() as i64) as usize,
                template_ids,
                display_names,
                occurrence_count: occurrences.max(0) as u32,
                avg_duration_ms: avg,
            });
        }
        Ok(patterns)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{sample_event, Shell};
    use crate::normalize::normalize;
    use crate::store::recovery;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();
        config
    }

    fn event(session: &str, ts: i64, cmd: &str, exit: i32) -> CommandEvent {
        let mut e = sample_event();
        e.session_id = session.to_string();
        e.ts_ms = ts;
        e.cmd_raw = cmd.to_string();
        e.exit_code = exit;
        e.repo_key = None;
        e
    }

    fn request(session: &str, now_ms: i64) -> RankRequest {
        RankRequest {
            session_id: session.to_string(),
            cwd: "/home/user/project".into(),
            repo_key: None,
            prefix: None,
            prev_cmd: None,
            now_ms,
            max_results: 0,
            ai_candidates: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_record_and_suggest_end_to_end() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(test_config(&dir)).unwrap();
        let base = 1_700_000_000_000;

        assert!(engine.record_event(event("s1", base, "git status", 0)).unwrap());
        assert!(engine
            .record_event(event("s1", base + 1_000, "git push", 0))
            .unwrap());
        assert!(engine.flush_sync(Duration::from_secs(2)));

        let response = engine.suggest(request("s1", base + 2_000)).await;
        assert_eq!(response.suggestions.len(), 2);
        assert!(response.suggestions.iter().all(|s| s.score > 0.0));

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejects_invalid_event() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(test_config(&dir)).unwrap();

        let mut bad = event("s1", 1_000, "ls", 0);
        bad.version = 7;
        assert!(matches!(
            engine.record_event(bad),
            Err(EngineError::InvalidInput(_))
        ));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_ephemeral_feeds_memory_not_disk() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let engine = Engine::open(config).unwrap();
        let base = 1_700_000_000_000;

        // Seed a two-step pattern so the ephemeral command has something
        // to advance.
        let a = normalize("cargo build").template_id;
        let b = normalize("cargo test").template_id;
        engine
            .store()
            .execute(
                "seed_pattern",
                "INSERT INTO workflow_patterns
                 (pattern_id, template_ids, display_names, step_count, occurrence_count)
                 VALUES ('build-test', ?1, ?2, 2, 3)",
                rusqlite::params![
                    serde_json::to_string(&[&a, &b]).unwrap(),
                    serde_json::to_string(&["cargo build", "cargo test"]).unwrap(),
                ],
            )
            .unwrap();
        assert_eq!(engine.reload_workflow_patterns().unwrap(), 1);

        let mut ephemeral = event("s1", base, "cargo build", 0);
        ephemeral.ephemeral = true;
        assert!(engine.record_event(ephemeral).unwrap());
        assert!(engine.flush_sync(Duration::from_secs(2)));

        // Nothing persisted...
        let count = engine
            .store()
            .query_row(
                "count",
                "SELECT COUNT(*) FROM command_events",
                [],
                |row| row.get::<_, i64>(0),
            )
            .unwrap();
        assert_eq!(count, Some(0));

        // ...but the workflow tracker advanced.
        let response = engine.suggest(request("s1", base + 1_000)).await;
        assert_eq!(response.workflow.len(), 1);
        assert_eq!(response.workflow[0].next_template_id, b);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_keystrokes_and_hints() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(test_config(&dir)).unwrap();

        assert!(!engine.on_keystroke("s1", 0).request_suggestion);
        assert!(!engine.on_keystroke("s1", 50).request_suggestion);
        let outcome = engine.on_keystroke("s1", 1_000);
        assert!(outcome.request_suggestion);
        assert_eq!(outcome.hint.suggested_pause_threshold_ms, 150);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_recovery_after_corruption() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let db_path = config.db_path();
        let base = 1_700_000_000_000;

        // Write some history and close cleanly.
        let engine = Engine::open(config.clone()).unwrap();
        assert!(engine.record_event(event("s1", base, "git status", 0)).unwrap());
        assert!(engine.flush_sync(Duration::from_secs(2)));
        engine.shutdown().await;

        // Clobber the database image.
        std::fs::write(&db_path, b"this is definitely not a database").unwrap();

        // Re-open with recovery enabled: fresh store, one history entry.
        let engine = Engine::open(config).unwrap();
        engine.store().run_integrity_check().unwrap();
        let count = engine
            .store()
            .query_row(
                "count",
                "SELECT COUNT(*) FROM command_events",
                [],
                |row| row.get::<_, i64>(0),
            )
            .unwrap();
        assert_eq!(count, Some(0), "recovered store starts empty");

        let history = recovery::load_history(&db_path).unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].recovery_success);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_corruption_bubbles_when_recovery_disabled() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.recovery.enabled = false;
        let db_path = config.db_path();

        std::fs::create_dir_all(db_path.parent().unwrap()).unwrap();
        std::fs::write(&db_path, b"garbage bytes, not sqlite").unwrap();

        let err = Engine::open(config).unwrap_err();
        assert!(err.is_corrupt(), "got {err:?}");
    }

    #[tokio::test]
    async fn test_event_count_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let base = 1_700_000_000_000;

        let engine = Engine::open(config.clone()).unwrap();
        for i in 0..7 {
            assert!(engine
                .record_event(event("s1", base + i, &format!("cmd{i}"), 0))
                .unwrap());
        }
        let mut ephemeral = event("s1", base + 100, "secret", 0);
        ephemeral.ephemeral = true;
        assert!(engine.record_event(ephemeral).unwrap());
        engine.shutdown().await;

        let engine = Engine::open(config).unwrap();
        let count = engine
            .store()
            .query_row(
                "count",
                "SELECT COUNT(*) FROM command_events",
                [],
                |row| row.get::<_, i64>(0),
            )
            .unwrap();
        assert_eq!(
            count,
            Some(7),
            "count equals non-ephemeral accepted events"
        );
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_shell_enum_is_recorded() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(test_config(&dir)).unwrap();
        let mut e = event("s1", 1_700_000_000_000, "ls", 0);
        e.shell = Shell::Fish;
        assert!(engine.record_event(e).unwrap());
        assert!(engine.flush_sync(Duration::from_secs(2)));

        let shell = engine
            .store()
            .query_row(
                "shell",
                "SELECT shell FROM sessions LIMIT 1",
                [],
                |row| row.get::<_, String>(0),
            )
            .unwrap();
        assert_eq!(shell.as_deref(), Some("fish"));
        engine.shutdown().await;
    }
}
