// Statistic scopes - the aggregation levels for frequency and transition data
//
// Every statistic row is keyed by a scope string: `global`, `repo:<key>`,
// `session:<id>` or `dir:<hash>`. The dir scope hashes the repo-relative
// working directory truncated to a few segments, so `crates/foo/src` and
// `crates/foo/src/bin` land in the same bucket while directories outside a
// repository produce no dir scope at all.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Number of path segments the dir scope keeps before hashing.
pub const DIR_SCOPE_MAX_DEPTH: usize = 3;

/// Aggregation level for a statistic row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Global,
    Repo(String),
    Session(String),
    Dir(String),
}

impl Scope {
    /// The persisted scope string.
    pub fn key(&self) -> String {
        match self {
            Scope::Global => "global".to_string(),
            Scope::Repo(k) => format!("repo:{k}"),
            Scope::Session(id) => format!("session:{id}"),
            Scope::Dir(hash) => format!("dir:{hash}"),
        }
    }

    pub fn session(id: impl Into<String>) -> Self {
        Scope::Session(id.into())
    }

    pub fn repo(key: impl Into<String>) -> Self {
        Scope::Repo(key.into())
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

/// Derive the dir-scope hash for a working directory inside a repository.
///
/// The path relative to `repo_root` is truncated at `max_depth` segments and
/// hashed; the same truncated path always yields the same hash. Returns
/// `None` when `cwd` is not under `repo_root`.
pub fn dir_key(cwd: &Path, repo_root: &Path, max_depth: usize) -> Option<String> {
    let rel = cwd.strip_prefix(repo_root).ok()?;
    let truncated: PathBuf = rel.components().take(max_depth).collect();
    let mut hasher = Sha256::new();
    hasher.update(truncated.to_string_lossy().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    Some(digest[..16].to_string())
}

/// Walk up from `start` looking for a `.git` entry, returning the containing
/// directory. Used by the write path and the ranker to anchor dir scopes;
/// callers cache the answer per cwd.
pub fn find_repo_root(start: &Path) -> Option<PathBuf> {
    let mut dir = Some(start);
    while let Some(d) = dir {
        if d.join(".git").exists() {
            return Some(d.to_path_buf());
        }
        dir = d.parent();
    }
    None
}

/// All scopes applicable to one event: global and session always, repo and
/// dir when derivable.
pub fn scopes_for(
    session_id: &str,
    repo_key: Option<&str>,
    dir_hash: Option<&str>,
) -> Vec<Scope> {
    let mut scopes = vec![Scope::Global, Scope::session(session_id)];
    if let Some(key) = repo_key {
        scopes.push(Scope::repo(key));
    }
    if let Some(hash) = dir_hash {
        scopes.push(Scope::Dir(hash.to_string()));
    }
    scopes
}
