//! Ranker - fuses evidence sources into one ordered suggestion list
//!
//! Queries run against a read-only connection pool so the suggestion hot
//! path never contends with the single writer.
//!
//! # Architecture
//!
//! ```text
//! Engine.suggest()
//!         │
//!         └──→ Ranker (r2d2 read-only pool)
//!                 │
//!                 ├──→ session source  (this session, any directory)
//!                 ├──→ cwd source      (this session, this directory)
//!                 └──→ global source   (all sessions, fallback)
//!                         │
//!                         └──→ fused score → dedupe → deterministic order
//! ```
//!
//! Sources are queried concurrently under an internal deadline (default
//! 50 ms); a source that errors or times out costs its candidates, never
//! the whole request.

use crate::error::Result;
use crate::normalize;
use crate::scope::{self, Scope};
use crate::stats;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OpenFlags};
use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::debug;

/// Evidence source a suggestion came from. Closed set; the ranker is the
/// single dispatch point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Session,
    Cwd,
    Global,
    Ai,
}

impl Source {
    /// Static scope weight: session evidence beats cwd beats ai beats
    /// global.
    pub fn weight(self) -> f64 {
        match self {
            Source::Session => 1.0,
            Source::Cwd => 0.7,
            Source::Global => 0.4,
            Source::Ai => 0.5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Source::Session => "session",
            Source::Cwd => "cwd",
            Source::Global => "global",
            Source::Ai => "ai",
        }
    }
}

/// One ranked suggestion.
#[derive(Debug, Clone)]
pub struct Suggestion {
    pub text: String,
    pub source: Source,
    /// Fused score in (0, 1].
    pub score: f64,
}

/// Everything the ranker needs for one request.
#[derive(Debug, Clone)]
pub struct RankRequest {
    pub session_id: String,
    pub cwd: String,
    pub repo_key: Option<String>,
    /// Text the user has typed so far; prefix-filters all sources.
    pub prefix: Option<String>,
    /// The previous command's raw form; drives tool affinity and the
    /// Markov boost.
    pub prev_cmd: Option<String>,
    pub now_ms: i64,
    pub max_results: usize,
    /// Out-of-band candidates from an AI provider, scored with the `ai`
    /// source weight. Usually empty.
    pub ai_candidates: Vec<String>,
}

/// Fusion coefficients. Renormalized at construction so a candidate that
/// maxes every component scores exactly 1.0.
#[derive(Debug, Clone, Copy)]
pub struct RankWeights {
    pub source: f64,
    pub recency: f64,
    pub success: f64,
    pub affinity: f64,
    pub markov: f64,
}

impl Default for RankWeights {
    fn default() -> Self {
        Self {
            source: 0.25,
            recency: 0.20,
            success: 0.15,
            affinity: 0.10,
            markov: 0.30,
        }
    }
}

impl RankWeights {
    fn normalized(self) -> Self {
        let sum = self.source + self.recency + self.success + self.affinity + self.markov;
        if sum <= 0.0 {
            return Self::default().normalized();
        }
        Self {
            source: self.source / sum,
            recency: self.recency / sum,
            success: self.success / sum,
            affinity: self.affinity / sum,
            markov: self.markov / sum,
        }
    }
}

/// Ranker tuning knobs.
#[derive(Debug, Clone)]
pub struct RankConfig {
    /// Internal deadline for all DB work; expiry returns partial results.
    pub deadline: Duration,
    pub half_life_ms: i64,
    pub weights: RankWeights,
    /// Read pool size.
    pub pool_size: u32,
}

impl Default for RankConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_millis(50),
            half_life_ms: stats::DEFAULT_HALF_LIFE_MS,
            weights: RankWeights::default(),
            pool_size: 4,
        }
    }
}

/// A raw candidate row before scoring.
#[derive(Debug, Clone)]
struct Candidate {
    text: String,
    cmd_norm: String,
    template_id: String,
    source: Source,
    last_seen_ms: i64,
    success_count: i64,
    failure_count: i64,
}

/// Decayed outgoing transitions at one `prev` template.
#[derive(Debug, Default, Clone)]
struct TransitionContext {
    weights: HashMap<String, f64>,
    total: f64,
}

/// Read-side ranker over the suggestion store.
pub struct Ranker {
    pool: Pool<SqliteConnectionManager>,
    weights: RankWeights,
    deadline: Duration,
    half_life_ms: i64,
}

impl Ranker {
    /// Open a read-only connection pool against the store's database file.
    pub fn new(db_path: &Path, config: RankConfig) -> Result<Self> {
        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX)
            .with_init(|conn| conn.busy_timeout(Duration::from_secs(5)));
        let pool = Pool::builder()
            .max_size(config.pool_size)
            .build(manager)
            .map_err(|e| crate::error::EngineError::Fatal(format!("read pool: {e}")))?;

        Ok(Self {
            pool,
            weights: config.weights.normalized(),
            deadline: config.deadline,
            half_life_ms: config.half_life_ms,
        })
    }

    /// Produce the ordered suggestion list for one request.
    ///
    /// Deterministic: for a fixed database snapshot and fixed inputs,
    /// repeated calls return identical ordering. Partial failure keeps the
    /// surviving sources; total failure yields an empty list.
    pub async fn rank(&self, req: RankRequest) -> Vec<Suggestion> {
        let deadline = Instant::now() + self.deadline;
        let prev_norm = req.prev_cmd.as_deref().map(normalize::normalize);
        let prev_tool = req
            .prev_cmd
            .as_deref()
            .and_then(normalize::tool_prefix)
            .map(str::to_string);

        // Markov context at the previous template: session scope first,
        // global as fallback when the session has no history yet.
        let transitions = match &prev_norm {
            Some(prev) => {
                let pool = self.pool.clone();
                let session_scope = Scope::session(&req.session_id).key();
                let prev_id = prev.template_id.clone();
                let now_ms = req.now_ms;
                let half_life = self.half_life_ms;
                tokio::task::spawn_blocking(move || {
                    outgoing_transitions(&pool, &session_scope, &prev_id, now_ms, half_life)
                        .ok()
                        .filter(|ctx| ctx.total > 0.0)
                        .or_else(|| {
                            outgoing_transitions(&pool, "global", &prev_id, now_ms, half_life).ok()
                        })
                        .unwrap_or_default()
                })
                .await
                .unwrap_or_default()
            }
            None => TransitionContext::default(),
        };

        // Fan the three sources out in parallel; each failure or timeout
        // costs only its own candidates.
        let mut tasks = Vec::with_capacity(3);
        for source in [Source::Session, Source::Cwd, Source::Global] {
            let pool = self.pool.clone();
            let req = req.clone();
            tasks.push((
                source,
                tokio::task::spawn_blocking(move || query_source(&pool, source, &req)),
            ));
        }

        let mut candidates: Vec<Candidate> = Vec::new();
        for (source, task) in tasks {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, task).await {
                Ok(Ok(Ok(rows))) => candidates.extend(rows),
                Ok(Ok(Err(e))) => debug!("rank source {} failed: {e}", source.as_str()),
                Ok(Err(e)) => debug!("rank source {} panicked: {e}", source.as_str()),
                Err(_) => debug!("rank source {} missed the deadline", source.as_str()),
            }
        }

        for text in &req.ai_candidates {
            let norm = normalize::normalize(text);
            candidates.push(Candidate {
                text: text.clone(),
                cmd_norm: norm.cmd_norm,
                template_id: norm.template_id,
                source: Source::Ai,
                last_seen_ms: 0,
                success_count: 0,
                failure_count: 0,
            });
        }

        self.fuse(candidates, &transitions, prev_tool.as_deref(), &req)
    }

    /// Score, dedupe, order and truncate.
    fn fuse(
        &self,
        candidates: Vec<Candidate>,
        transitions: &TransitionContext,
        prev_tool: Option<&str>,
        req: &RankRequest,
    ) -> Vec<Suggestion> {
        let w = &self.weights;
        let mut scored: Vec<(Candidate, f64)> = candidates
            .into_iter()
            .map(|c| {
                let source_w = c.source.weight();

                let hours_ago = ((req.now_ms - c.last_seen_ms).max(0)) as f64 / 3_600_000.0;
                let recency = (-hours_ago / 24.0).exp().clamp(0.0, 1.0);

                let success = stats::success_ratio(c.success_count, c.failure_count);

                let affinity = match (prev_tool, normalize::tool_prefix(&c.text)) {
                    (Some(prev), Some(tool)) if prev == tool => 1.0,
                    _ => 0.0,
                };

                let markov = if transitions.total > 0.0 {
                    transitions
                        .weights
                        .get(&c.template_id)
                        .map(|weight| weight / transitions.total)
                        .unwrap_or(0.0)
                } else {
                    0.0
                };

                let score = w.source * source_w
                    + w.recency * recency
                    + w.success * success
                    + w.affinity * affinity
                    + w.markov * markov;
                (c, score.clamp(f64::MIN_POSITIVE, 1.0))
            })
            .collect();

        // Dedupe by exact normalized text, keeping the best-scoring copy.
        let mut best: HashMap<String, usize> = HashMap::new();
        let mut keep: Vec<(Candidate, f64)> = Vec::with_capacity(scored.len());
        for (candidate, score) in scored.drain(..) {
            match best.get(&candidate.cmd_norm) {
                Some(&idx) if keep[idx].1 >= score => {}
                Some(&idx) => keep[idx] = (candidate, score),
                None => {
                    best.insert(candidate.cmd_norm.clone(), keep.len());
                    keep.push((candidate, score));
                }
            }
        }

        // Score descending, then most recent, then lexicographic text:
        // a total order, so repeated calls are bit-identical.
        keep.sort_by(|(a, sa), (b, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.last_seen_ms.cmp(&a.last_seen_ms))
                .then_with(|| a.text.cmp(&b.text))
        });
        keep.truncate(req.max_results);

        keep.into_iter()
            .map(|(c, score)| Suggestion {
                text: c.text,
                source: c.source,
                score,
            })
            .collect()
    }
}

impl std::fmt::Debug for Ranker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ranker")
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

/// Decayed outgoing transition weights at `prev_template_id` in one scope.
fn outgoing_transitions(
    pool: &Pool<SqliteConnectionManager>,
    scope_key: &str,
    prev_template_id: &str,
    now_ms: i64,
    half_life_ms: i64,
) -> Result<TransitionContext> {
    let conn = pool
        .get()
        .map_err(|e| crate::error::EngineError::Transient(format!("read pool: {e}")))?;
    let mut stmt = conn.prepare_cached(
        "SELECT next_template_id, weight, last_seen_ms FROM transitions
         WHERE scope = ?1 AND prev_template_id = ?2",
    )?;
    let rows = stmt.query_map(params![scope_key, prev_template_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, f64>(1)?,
            row.get::<_, i64>(2)?,
        ))
    })?;

    let mut ctx = TransitionContext::default();
    for row in rows {
        let (next, weight, last_seen) = row?;
        let decayed = stats::decay(weight, last_seen, now_ms, half_life_ms);
        ctx.total += decayed;
        ctx.weights.insert(next, decayed);
    }
    Ok(ctx)
}

/// Run one source query, at most `max_results` rows.
fn query_source(
    pool: &Pool<SqliteConnectionManager>,
    source: Source,
    req: &RankRequest,
) -> Result<Vec<Candidate>> {
    let conn = pool
        .get()
        .map_err(|e| crate::error::EngineError::Transient(format!("read pool: {e}")))?;

    let prefix_pattern = req.prefix.as_deref().map(like_prefix);
    let stats_scope = stats_scope_for(source, req);
    let limit = req.max_results as i64;

    let (sql, bind_cwd) = match source {
        Source::Session | Source::Ai => (
            "SELECT e.cmd_raw, e.cmd_norm, e.template_id, MAX(e.ts_ms) AS last_seen,
                    COALESCE(s.success_count, 0), COALESCE(s.failure_count, 0)
             FROM command_events e
             LEFT JOIN command_stats s
                    ON s.scope = ?1 AND s.template_id = e.template_id
             WHERE e.session_id = ?2
               AND (?3 IS NULL OR e.cmd_raw LIKE ?3 ESCAPE '\\')
             GROUP BY e.cmd_norm
             ORDER BY last_seen DESC
             LIMIT ?4",
            false,
        ),
        Source::Cwd => (
            "SELECT e.cmd_raw, e.cmd_norm, e.template_id, MAX(e.ts_ms) AS last_seen,
                    COALESCE(s.success_count, 0), COALESCE(s.failure_count, 0)
             FROM command_events e
             LEFT JOIN command_stats s
                    ON s.scope = ?1 AND s.template_id = e.template_id
             WHERE e.session_id = ?2 AND e.cwd = ?5
               AND (?3 IS NULL OR e.cmd_raw LIKE ?3 ESCAPE '\\')
             GROUP BY e.cmd_norm
             ORDER BY last_seen DESC
             LIMIT ?4",
            true,
        ),
        Source::Global => (
            "SELECT e.cmd_raw, e.cmd_norm, e.template_id, MAX(e.ts_ms) AS last_seen,
                    COALESCE(s.success_count, 0), COALESCE(s.failure_count, 0)
             FROM command_events e
             LEFT JOIN command_stats s
                    ON s.scope = ?1 AND s.template_id = e.template_id
             WHERE (?3 IS NULL OR e.cmd_raw LIKE ?3 ESCAPE '\\')
             GROUP BY e.cmd_norm
             ORDER BY last_seen DESC
             LIMIT ?4",
            false,
        ),
    };

    let mut stmt = conn.prepare_cached(sql)?;
    let map_row = |row: &rusqlite::Row<'_>| {
        Ok(Candidate {
            text: row.get(0)?,
            cmd_norm: row.get(1)?,
            template_id: row.get(2)?,
            source,
            last_seen_ms: row.get(3)?,
            success_count: row.get(4)?,
            failure_count: row.get(5)?,
        })
    };

    let rows = if bind_cwd {
        stmt.query_map(
            params![stats_scope, req.session_id, prefix_pattern, limit, req.cwd],
            map_row,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?
    } else {
        stmt.query_map(
            params![stats_scope, req.session_id, prefix_pattern, limit],
            map_row,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?
    };

    Ok(rows)
}

/// The stats scope joined for a given evidence source.
fn stats_scope_for(source: Source, req: &RankRequest) -> String {
    match source {
        Source::Session | Source::Ai => Scope::session(&req.session_id).key(),
        Source::Global => Scope::Global.key(),
        Source::Cwd => {
            let cwd = Path::new(&req.cwd);
            scope::find_repo_root(cwd)
                .and_then(|root| scope::dir_key(cwd, &root, scope::DIR_SCOPE_MAX_DEPTH))
                .map(|hash| Scope::Dir(hash).key())
                .or_else(|| req.repo_key.as_deref().map(|k| Scope::repo(k).key()))
                .unwrap_or_else(|| Scope::session(&req.session_id).key())
        }
    }
}

/// Escape LIKE metacharacters and append the wildcard.
fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}
