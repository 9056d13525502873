// Daemon lock - single process instance per data directory
//
// The lock file holds an exclusive advisory lock for the daemon's lifetime
// and records the holder's PID for humans poking at the data directory.
// Startup fails fast (after a bounded retry) when another daemon holds it.

use crate::error::{EngineError, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

/// Lock file name inside the data directory.
pub const LOCK_FILE: &str = ".daemon.lock";

/// Held for the lifetime of the daemon process; releases on drop.
#[derive(Debug)]
pub struct DaemonLock {
    file: File,
    path: PathBuf,
}

impl DaemonLock {
    /// Acquire the lock under `data_dir`, retrying every 100 ms up to
    /// `timeout`. The file contents become the holder's decimal PID.
    pub fn acquire(data_dir: &Path, timeout: Duration) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(e) => {
                    return Err(EngineError::ResourceUnavailable(format!(
                        "daemon already running ({}): {e}",
                        path.display()
                    )));
                }
            }
        }

        let mut writer = &file;
        let _ = file.set_len(0);
        let _ = write!(writer, "{}", std::process::id());
        let _ = writer.flush();

        debug!("daemon lock acquired at {}", path.display());
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DaemonLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!("daemon lock released at {}", self.path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_acquire_writes_pid() {
        let dir = tempdir().unwrap();
        let lock = DaemonLock::acquire(dir.path(), Duration::from_millis(100)).unwrap();
        let contents = std::fs::read_to_string(lock.path()).unwrap();
        assert_eq!(contents, std::process::id().to_string());
    }

    #[test]
    fn test_second_acquire_fails_fast() {
        let dir = tempdir().unwrap();
        let _held = DaemonLock::acquire(dir.path(), Duration::from_millis(100)).unwrap();
        let err = DaemonLock::acquire(dir.path(), Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, EngineError::ResourceUnavailable(_)));
    }

    #[test]
    fn test_released_on_drop() {
        let dir = tempdir().unwrap();
        {
            let _lock = DaemonLock::acquire(dir.path(), Duration::from_millis(100)).unwrap();
        }
        assert!(DaemonLock::acquire(dir.path(), Duration::from_millis(100)).is_ok());
    }

    #[test]
    fn test_creates_data_dir() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("deeper");
        let lock = DaemonLock::acquire(&nested, Duration::from_millis(100)).unwrap();
        assert!(nested.exists());
        drop(lock);
    }
}
