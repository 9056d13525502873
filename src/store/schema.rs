/// Inline SQL migrations for the suggestion store.
///
/// Migrations are forward-only and applied in order, each inside its own
/// transaction; `schema_migrations` records `(version, applied_ms)` so a
/// store opened by a newer build is refused rather than mangled by an older
/// one. Versions are 1-based indices into this slice.
pub const MIGRATIONS: &[&str] = &[
    // Migration 1: sessions
    r#"
CREATE TABLE IF NOT EXISTS sessions (
    id            TEXT PRIMARY KEY,
    shell         TEXT NOT NULL,
    started_at_ms INTEGER NOT NULL,
    project_types TEXT
);
"#,
    // Migration 2: command_events + access-path indexes
    r#"
CREATE TABLE IF NOT EXISTS command_events (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id  TEXT NOT NULL REFERENCES sessions(id),
    ts_ms       INTEGER NOT NULL,
    cwd         TEXT NOT NULL,
    repo_key    TEXT,
    branch      TEXT,
    cmd_raw     TEXT NOT NULL,
    cmd_norm    TEXT NOT NULL,
    truncated   INTEGER NOT NULL DEFAULT 0,
    template_id TEXT NOT NULL,
    exit_code   INTEGER NOT NULL DEFAULT 0,
    duration_ms INTEGER
);
CREATE INDEX IF NOT EXISTS idx_events_session_ts ON command_events(session_id, ts_ms);
CREATE INDEX IF NOT EXISTS idx_events_session_cwd ON command_events(session_id, cwd, ts_ms);
CREATE INDEX IF NOT EXISTS idx_events_template ON command_events(template_id);
CREATE INDEX IF NOT EXISTS idx_events_ts ON command_events(ts_ms);
"#,
    // Migration 3: command_templates
    r#"
CREATE TABLE IF NOT EXISTS command_templates (
    template_id   TEXT PRIMARY KEY,
    cmd_norm      TEXT NOT NULL,
    tags          TEXT NOT NULL DEFAULT '[]',
    slot_count    INTEGER NOT NULL DEFAULT 0,
    first_seen_ms INTEGER NOT NULL,
    last_seen_ms  INTEGER NOT NULL
);
"#,
    // Migration 4: per-scope decayed frequency statistics
    r#"
CREATE TABLE IF NOT EXISTS command_stats (
    scope         TEXT NOT NULL,
    template_id   TEXT NOT NULL,
    score         REAL NOT NULL DEFAULT 0,
    success_count INTEGER NOT NULL DEFAULT 0,
    failure_count INTEGER NOT NULL DEFAULT 0,
    last_seen_ms  INTEGER NOT NULL,
    PRIMARY KEY (scope, template_id)
);
"#,
    // Migration 5: per-scope Markov bigram transitions
    r#"
CREATE TABLE IF NOT EXISTS transitions (
    scope            TEXT NOT NULL,
    prev_template_id TEXT NOT NULL,
    next_template_id TEXT NOT NULL,
    weight           REAL NOT NULL DEFAULT 0,
    count            INTEGER NOT NULL DEFAULT 0,
    last_seen_ms     INTEGER NOT NULL,
    PRIMARY KEY (scope, prev_template_id, next_template_id)
);
CREATE INDEX IF NOT EXISTS idx_transitions_prev ON transitions(scope, prev_template_id);
"#,
    // Migration 6: failure -> recovery observations
    r#"
CREATE TABLE IF NOT EXISTS recovery_candidates (
    scope                TEXT NOT NULL,
    failed_template_id   TEXT NOT NULL,
    exit_code_class      TEXT NOT NULL,
    recovery_template_id TEXT NOT NULL,
    weight               REAL NOT NULL DEFAULT 0,
    count                INTEGER NOT NULL DEFAULT 0,
    success_rate         REAL NOT NULL DEFAULT 0,
    last_seen_ms         INTEGER NOT NULL,
    PRIMARY KEY (scope, failed_template_id, exit_code_class, recovery_template_id)
);
"#,
    // Migration 7: offline-mined workflow patterns
    r#"
CREATE TABLE IF NOT EXISTS workflow_patterns (
    pattern_id       TEXT PRIMARY KEY,
    template_ids     TEXT NOT NULL,
    display_names    TEXT NOT NULL,
    step_count       INTEGER NOT NULL,
    occurrence_count INTEGER NOT NULL DEFAULT 0,
    avg_duration_ms  INTEGER
);
"#,
    // Migration 8: full-text search over raw commands (external content mode)
    r#"
CREATE VIRTUAL TABLE IF NOT EXISTS command_fts USING fts5(
    cmd_raw,
    content=command_events,
    content_rowid=id,
    tokenize='porter unicode61'
);
"#,
];
