// Corruption recovery - rotate the damaged store aside and start fresh
//
// When SQLite reports a malformed image (or an integrity check fails), the
// main database and its journal companions are renamed to timestamped
// `.corrupt.` backups rather than deleted; the user keeps the evidence and
// the daemon keeps running on a fresh store. Every rotation is recorded in
// an append-only JSON history next to the database.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// File name of the corruption history, kept in the store's directory.
pub const HISTORY_FILE: &str = "corruption_history.json";

/// Companion suffixes rotated together with the main database file.
const COMPANION_SUFFIXES: [&str; 3] = ["", "-wal", "-shm"];

/// One recorded rotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorruptionRecord {
    /// Unix seconds at rotation time.
    pub timestamp: i64,
    pub original_path: String,
    pub original_size_bytes: u64,
    /// Path the main database file was renamed to.
    pub corrupt_backup: String,
    pub reason: String,
    pub recovery_success: bool,
}

fn history_path(db_path: &Path) -> PathBuf {
    db_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(HISTORY_FILE)
}

/// Load the corruption history. A missing or empty file is an empty
/// history; malformed JSON is an error, not something to silently discard.
pub fn load_history(db_path: &Path) -> Result<Vec<CorruptionRecord>> {
    let path = history_path(db_path);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&raw).map_err(|e| {
        EngineError::Fatal(format!(
            "corruption history at {} is malformed: {e}",
            path.display()
        ))
    })
}

/// Append one record to the history file.
pub fn append_history(db_path: &Path, record: &CorruptionRecord) -> Result<()> {
    let mut history = load_history(db_path)?;
    history.push(record.clone());
    let path = history_path(db_path);
    let serialized = serde_json::to_string_pretty(&history)
        .map_err(|e| EngineError::Fatal(format!("cannot serialize corruption history: {e}")))?;
    fs::write(&path, serialized)?;
    Ok(())
}

/// Rotate the database and its journal companions to timestamped backups.
///
/// Absent companions are skipped, so re-running rotation against an
/// already-rotated directory creates no second backup. Returns the record
/// to append once the re-open outcome is known; `recovery_success` starts
/// out false.
pub fn rotate_corrupt(db_path: &Path, reason: &str) -> Result<CorruptionRecord> {
    let timestamp = chrono::Utc::now().timestamp();
    let original_size = fs::metadata(db_path).map(|m| m.len()).unwrap_or(0);
    let backup_base = format!("{}.corrupt.{timestamp}", db_path.display());

    for suffix in COMPANION_SUFFIXES {
        let source = PathBuf::from(format!("{}{suffix}", db_path.display()));
        if !source.exists() {
            continue;
        }
        let target = PathBuf::from(format!("{backup_base}{suffix}"));
        match fs::rename(&source, &target) {
            Ok(()) => info!("rotated {} -> {}", source.display(), target.display()),
            Err(e) => warn!("could not rotate {}: {e}", source.display()),
        }
    }

    Ok(CorruptionRecord {
        timestamp,
        original_path: db_path.display().to_string(),
        original_size_bytes: original_size,
        corrupt_backup: backup_base,
        reason: reason.to_string(),
        recovery_success: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_missing_history_is_empty() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("suggestions.db");
        assert!(load_history(&db).unwrap().is_empty());
    }

    #[test]
    fn test_load_empty_history_is_empty() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("suggestions.db");
        fs::write(dir.path().join(HISTORY_FILE), "").unwrap();
        assert!(load_history(&db).unwrap().is_empty());
    }

    #[test]
    fn test_load_malformed_history_fails() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("suggestions.db");
        fs::write(dir.path().join(HISTORY_FILE), "{not json]").unwrap();
        assert!(load_history(&db).is_err());
    }

    #[test]
    fn test_append_accumulates_records() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("suggestions.db");
        let record = CorruptionRecord {
            timestamp: 1_700_000_000,
            original_path: db.display().to_string(),
            original_size_bytes: 42,
            corrupt_backup: format!("{}.corrupt.1700000000", db.display()),
            reason: "test".into(),
            recovery_success: true,
        };
        append_history(&db, &record).unwrap();
        append_history(&db, &record).unwrap();
        let history = load_history(&db).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].recovery_success);
    }

    #[test]
    fn test_rotate_moves_all_companions() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("suggestions.db");
        fs::write(&db, b"main").unwrap();
        fs::write(format!("{}-wal", db.display()), b"wal").unwrap();
        fs::write(format!("{}-shm", db.display()), b"shm").unwrap();

        let record = rotate_corrupt(&db, "malformed").unwrap();
        assert!(!db.exists());
        assert_eq!(record.original_size_bytes, 4);
        assert!(Path::new(&record.corrupt_backup).exists());
        assert!(Path::new(&format!("{}-wal", record.corrupt_backup)).exists());
        assert!(Path::new(&format!("{}-shm", record.corrupt_backup)).exists());
    }

    #[test]
    fn test_rotate_tolerates_missing_companions() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("suggestions.db");
        fs::write(&db, b"main only").unwrap();

        let record = rotate_corrupt(&db, "malformed").unwrap();
        assert!(Path::new(&record.corrupt_backup).exists());
        assert!(!Path::new(&format!("{}-wal", record.corrupt_backup)).exists());
    }

    #[test]
    fn test_rotate_on_rotated_directory_creates_no_backup() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("suggestions.db");
        // Nothing on disk: rotation is a no-op apart from the record.
        let record = rotate_corrupt(&db, "again").unwrap();
        assert!(!Path::new(&record.corrupt_backup).exists());
        assert_eq!(record.original_size_bytes, 0);
    }
}
