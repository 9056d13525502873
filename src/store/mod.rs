// Embedded store - single-writer SQLite with WAL journaling
//
// One process owns one writer connection, guarded by an advisory file lock
// so a second daemon cannot scribble over the same database. Readers go
// through a separate read-only pool (see `rank`); the ingestion writer, the
// maintenance loop and recovery serialize on the writer connection held
// here.

pub mod recovery;
pub mod schema;

use crate::error::{classify_sqlite, EngineError, Result};
use fs2::FileExt;
use rusqlite::Connection;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// How the periodic WAL checkpoint should behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointMode {
    /// Non-blocking; skips frames still in use by readers.
    Passive,
    /// Blocks until the log is fully checkpointed, then truncates it.
    Truncate,
}

impl CheckpointMode {
    fn pragma(self) -> &'static str {
        match self {
            CheckpointMode::Passive => "PRAGMA wal_checkpoint(PASSIVE)",
            CheckpointMode::Truncate => "PRAGMA wal_checkpoint(TRUNCATE)",
        }
    }
}

/// Store tuning knobs.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// How long `open` waits for the exclusive file lock.
    pub lock_timeout: Duration,
    /// Retry interval while waiting for the lock.
    pub lock_retry: Duration,
    /// SQLite busy timeout on the writer connection.
    pub busy_timeout: Duration,
    /// Rotate and re-open on corruption instead of failing.
    pub recover_on_corruption: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            lock_retry: Duration::from_millis(100),
            busy_timeout: Duration::from_secs(5),
            recover_on_corruption: true,
        }
    }
}

/// Durable, crash-safe storage for command history, templates and decayed
/// statistics. Exactly one writer connection per process.
pub struct Store {
    path: PathBuf,
    options: StoreOptions,
    conn: Mutex<Option<Connection>>,
    lock_file: Mutex<Option<File>>,
    /// Named SQL registry backing the prepared-statement cache. Read-mostly;
    /// the miss path takes the write lock and double-checks.
    statements: RwLock<HashMap<String, Arc<str>>>,
}

impl Store {
    /// Open (or create) the store at `path`: ensure the parent directory,
    /// take the exclusive lock, configure WAL and run pending migrations.
    ///
    /// When the database image is corrupt and `recover_on_corruption` is
    /// set, the corrupt files are rotated aside, a corruption-history entry
    /// is written and a fresh store is opened in their place.
    pub fn open(path: &Path, options: StoreOptions) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let lock_file = acquire_file_lock(&lock_path(path), &options)?;

        let conn = match open_connection(path, &options) {
            Ok(conn) => conn,
            Err(e) if e.is_corrupt() && options.recover_on_corruption => {
                warn!("store at {} is corrupt: {e}; rotating", path.display());
                let mut record = recovery::rotate_corrupt(path, &e.to_string())?;
                let reopened = open_connection(path, &options);
                record.recovery_success = reopened.is_ok();
                recovery::append_history(path, &record)?;
                let conn = reopened?;
                info!("store recovered at {}", path.display());
                conn
            }
            Err(e) => return Err(e),
        };

        info!("store opened at {}", path.display());
        Ok(Self {
            path: path.to_owned(),
            options,
            conn: Mutex::new(Some(conn)),
            lock_file: Mutex::new(Some(lock_file)),
            statements: RwLock::new(HashMap::new()),
        })
    }

    /// In-memory store for tests; no file lock, no recovery.
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory().map_err(classify_sqlite)?;
        configure_connection(&conn, &StoreOptions::default())?;
        migrate(&mut conn)?;
        Ok(Self {
            path: PathBuf::new(),
            options: StoreOptions::default(),
            conn: Mutex::new(Some(conn)),
            lock_file: Mutex::new(None),
            statements: RwLock::new(HashMap::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the main database file on disk, 0 for in-memory stores.
    pub fn file_size(&self) -> u64 {
        fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    /// Run `f` against the writer connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| EngineError::Fatal("store mutex poisoned".into()))?;
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(EngineError::Fatal("store is closed".into())),
        }
    }

    /// Run `f` against the writer connection with mutable access (needed
    /// for explicit transactions).
    pub fn with_conn_mut<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| EngineError::Fatal("store mutex poisoned".into()))?;
        match guard.as_mut() {
            Some(conn) => f(conn),
            None => Err(EngineError::Fatal("store is closed".into())),
        }
    }

    /// Look up (or intern) the SQL for a named statement.
    ///
    /// The returned text is fed through the connection's prepared-statement
    /// cache, so repeated executions of the same name skip re-parsing.
    pub fn cached_sql(&self, name: &str, sql: &str) -> Arc<str> {
        if let Ok(read) = self.statements.read() {
            if let Some(found) = read.get(name) {
                return Arc::clone(found);
            }
        }
        let mut write = match self.statements.write() {
            Ok(w) => w,
            // A poisoned registry only costs us the cache, not correctness.
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(
            write
                .entry(name.to_string())
                .or_insert_with(|| Arc::from(sql)),
        )
    }

    /// Execute a named parameterized statement, returning affected rows.
    pub fn execute(&self, name: &str, sql: &str, params: impl rusqlite::Params) -> Result<usize> {
        let sql = self.cached_sql(name, sql);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&sql).map_err(classify_sqlite)?;
            stmt.execute(params).map_err(classify_sqlite)
        })
    }

    /// Run a named single-row query; `None` when no row matches.
    pub fn query_row<T>(
        &self,
        name: &str,
        sql: &str,
        params: impl rusqlite::Params,
        f: impl FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Option<T>> {
        let sql = self.cached_sql(name, sql);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&sql).map_err(classify_sqlite)?;
            match stmt.query_row(params, f) {
                Ok(v) => Ok(Some(v)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(classify_sqlite(e)),
            }
        })
    }

    /// Checkpoint the write-ahead log.
    pub fn checkpoint(&self, mode: CheckpointMode) -> Result<()> {
        self.with_conn(|conn| {
            conn.query_row(mode.pragma(), [], |_| Ok(()))
                .map_err(classify_sqlite)
        })?;
        debug!("wal checkpoint {:?} complete", mode);
        Ok(())
    }

    /// Run the engine's integrity check; any row other than "ok" is a
    /// corruption report.
    pub fn run_integrity_check(&self) -> Result<()> {
        let rows: Vec<String> = self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("PRAGMA integrity_check")
                .map_err(classify_sqlite)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(classify_sqlite)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(classify_sqlite)?;
            Ok(rows)
        })?;

        if rows.iter().all(|r| r == "ok") {
            Ok(())
        } else {
            Err(EngineError::Corrupt(rows.join("; ")))
        }
    }

    /// Rotate a corrupt database aside and re-open fresh in place.
    ///
    /// Used after a failed [`run_integrity_check`](Self::run_integrity_check);
    /// the file lock stays held throughout so no other process can race the
    /// rotation. The corruption history records the outcome either way.
    pub fn recover(&self, reason: &str) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(EngineError::Fatal(
                "cannot recover an in-memory store".into(),
            ));
        }
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| EngineError::Fatal("store mutex poisoned".into()))?;
        // Close the current connection before touching the files.
        drop(guard.take());

        let mut record = recovery::rotate_corrupt(&self.path, reason)?;
        let reopened = open_connection(&self.path, &self.options);
        record.recovery_success = reopened.is_ok();
        recovery::append_history(&self.path, &record)?;

        *guard = Some(reopened?);
        info!("store recovered at {} ({reason})", self.path.display());
        Ok(())
    }

    /// Checkpoint-truncate the journal, close the connection and release
    /// the lock. Idempotent; also runs on drop.
    pub fn close(&self) {
        let Ok(mut guard) = self.conn.lock() else {
            return;
        };
        if let Some(conn) = guard.take() {
            if let Err(e) = conn.query_row(CheckpointMode::Truncate.pragma(), [], |_| Ok(())) {
                warn!("final wal checkpoint failed: {e}");
            }
            drop(conn);
        }
        if let Ok(mut lock) = self.lock_file.lock() {
            if let Some(file) = lock.take() {
                let _ = FileExt::unlock(&file);
            }
        }
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Sidecar lock-file path for a database path.
fn lock_path(db_path: &Path) -> PathBuf {
    let mut os = db_path.as_os_str().to_owned();
    os.push(".lock");
    PathBuf::from(os)
}

/// Acquire the exclusive store lock, retrying every `lock_retry` until
/// `lock_timeout` elapses.
fn acquire_file_lock(lock_path: &Path, options: &StoreOptions) -> Result<File> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(lock_path)?;

    let deadline = Instant::now() + options.lock_timeout;
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => {
                let mut f = &file;
                let _ = f.set_len(0);
                let _ = write!(f, "{}", std::process::id());
                return Ok(file);
            }
            Err(_) if Instant::now() < deadline => {
                std::thread::sleep(options.lock_retry);
            }
            Err(e) => {
                return Err(EngineError::ResourceUnavailable(format!(
                    "store lock at {} held by another process: {e}",
                    lock_path.display()
                )));
            }
        }
    }
}

/// Open the writer connection, configure pragmas and run migrations.
fn open_connection(path: &Path, options: &StoreOptions) -> Result<Connection> {
    let mut conn = Connection::open(path).map_err(classify_sqlite)?;
    configure_connection(&conn, options)?;
    migrate(&mut conn)?;
    Ok(conn)
}

fn configure_connection(conn: &Connection, options: &StoreOptions) -> Result<()> {
    conn.busy_timeout(options.busy_timeout)
        .map_err(classify_sqlite)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;",
    )
    .map_err(classify_sqlite)?;
    Ok(())
}

/// Apply pending forward-only migrations, each in its own transaction.
///
/// Refuses to open a database whose recorded version exceeds the compiled
/// migration count: letting an older build write to a newer schema is how
/// data gets corrupted across downgrades.
fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY,
            applied_ms INTEGER NOT NULL
        );",
    )
    .map_err(classify_sqlite)?;

    let current: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(classify_sqlite)?;

    let compiled = schema::MIGRATIONS.len() as i64;
    if current > compiled {
        return Err(EngineError::Fatal(format!(
            "database schema version {current} is newer than this build supports ({compiled})"
        )));
    }

    for (i, sql) in schema::MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i64;
        if version <= current {
            continue;
        }
        let tx = conn.transaction().map_err(classify_sqlite)?;
        tx.execute_batch(sql).map_err(classify_sqlite)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_ms) VALUES (?1, ?2)",
            rusqlite::params![version, chrono::Utc::now().timestamp_millis()],
        )
        .map_err(classify_sqlite)?;
        tx.commit().map_err(classify_sqlite)?;
        debug!("applied migration {version}");
    }

    Ok(())
}

/// Periodic WAL checkpoint worker owned by the store.
///
/// Every `interval` it checkpoints the journal: `TRUNCATE` when fewer than
/// `low_activity_threshold` events arrived since the previous run, `PASSIVE`
/// otherwise. Exits promptly on shutdown.
pub fn spawn_checkpoint_task(
    store: Arc<Store>,
    interval: Duration,
    event_count: impl Fn() -> u64 + Send + 'static,
    low_activity_threshold: u64,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it.
        ticker.tick().await;

        let mut last_count = event_count();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let count = event_count();
                    let delta = count.saturating_sub(last_count);
                    last_count = count;
                    let mode = if delta < low_activity_threshold {
                        CheckpointMode::Truncate
                    } else {
                        CheckpointMode::Passive
                    };
                    let store = Arc::clone(&store);
                    let result = tokio::task::spawn_blocking(move || store.checkpoint(mode)).await;
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!("periodic wal checkpoint failed: {e}"),
                        Err(e) => warn!("checkpoint task panicked: {e}"),
                    }
                }
            }
        }
        debug!("checkpoint worker stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_creates_schema() {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("suggestions.db"), StoreOptions::default())
            .expect("open should succeed");

        let count = store
            .query_row(
                "count_events",
                "SELECT COUNT(*) FROM command_events",
                [],
                |row| row.get::<_, i64>(0),
            )
            .unwrap();
        assert_eq!(count, Some(0));
        assert!(store.run_integrity_check().is_ok());
    }

    #[test]
    fn test_open_creates_parent_directory() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a").join("b").join("suggestions.db");
        let store = Store::open(&nested, StoreOptions::default()).unwrap();
        assert!(nested.exists());
        drop(store);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("suggestions.db");
        let first = Store::open(&path, StoreOptions::default()).unwrap();
        first.close();
        // Re-applying all migrations to a fully-migrated store is a no-op.
        let second = Store::open(&path, StoreOptions::default()).unwrap();
        let version = second
            .query_row(
                "max_version",
                "SELECT MAX(version) FROM schema_migrations",
                [],
                |row| row.get::<_, i64>(0),
            )
            .unwrap();
        assert_eq!(version, Some(schema::MIGRATIONS.len() as i64));
    }

    #[test]
    fn test_refuses_newer_schema_version() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("suggestions.db");
        let store = Store::open(&path, StoreOptions::default()).unwrap();
        store
            .execute(
                "bump_version",
                "INSERT INTO schema_migrations (version, applied_ms) VALUES (?1, ?2)",
                rusqlite::params![schema::MIGRATIONS.len() as i64 + 10, 0i64],
            )
            .unwrap();
        store.close();

        let err = Store::open(&path, StoreOptions::default()).unwrap_err();
        assert!(matches!(err, EngineError::Fatal(_)), "got {err:?}");
    }

    #[test]
    fn test_second_open_blocks_on_lock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("suggestions.db");
        let _held = Store::open(&path, StoreOptions::default()).unwrap();

        let options = StoreOptions {
            lock_timeout: Duration::from_millis(200),
            lock_retry: Duration::from_millis(50),
            ..StoreOptions::default()
        };
        let err = Store::open(&path, options).unwrap_err();
        assert!(matches!(err, EngineError::ResourceUnavailable(_)));
    }

    #[test]
    fn test_lock_released_on_close() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("suggestions.db");
        let store = Store::open(&path, StoreOptions::default()).unwrap();
        store.close();
        // Same process can re-open once the first handle released the lock.
        let reopened = Store::open(&path, StoreOptions::default());
        assert!(reopened.is_ok());
    }

    #[test]
    fn test_close_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        store.close();
        store.close();
        assert!(matches!(
            store.run_integrity_check(),
            Err(EngineError::Fatal(_))
        ));
    }

    #[test]
    fn test_cached_sql_interns_by_name() {
        let store = Store::open_in_memory().unwrap();
        let a = store.cached_sql("q", "SELECT 1");
        let b = store.cached_sql("q", "SELECT 1");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_checkpoint_modes() {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("suggestions.db"), StoreOptions::default())
            .unwrap();
        store.checkpoint(CheckpointMode::Passive).unwrap();
        store.checkpoint(CheckpointMode::Truncate).unwrap();
    }

    #[test]
    fn test_fts_table_exists() {
        let store = Store::open_in_memory().unwrap();
        // Insert through the content table, index manually, then query FTS.
        store
            .execute(
                "ins_session",
                "INSERT INTO sessions (id, shell, started_at_ms) VALUES ('s', 'zsh', 1)",
                [],
            )
            .unwrap();
        store.execute(
            "ins_event",
            "INSERT INTO command_events (session_id, ts_ms, cwd, cmd_raw, cmd_norm, template_id)
             VALUES ('s', 1, '/tmp', 'echo hello', 'echo hello', 't1')",
            [],
        )
        .unwrap();
        store
            .execute(
                "ins_fts",
                "INSERT INTO command_fts (rowid, cmd_raw)
                 SELECT id, cmd_raw FROM command_events",
                [],
            )
            .unwrap();

        let hit = store
            .query_row(
                "fts_query",
                "SELECT COUNT(*) FROM command_fts WHERE command_fts MATCH 'hello'",
                [],
                |row| row.get::<_, i64>(0),
            )
            .unwrap();
        assert_eq!(hit, Some(1));
    }
}
