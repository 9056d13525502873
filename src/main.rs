// clai-daemon - local suggestion engine for interactive shells
//
// The daemon owns the suggestion store for one data directory and feeds it
// from shell hooks. Events arrive as NDJSON on stdin (one object per line,
// produced by the hook shims); suggestions are served to the interactive
// caller through the library's Engine handle.
//
// Architecture:
// - Engine: store + ingestion writer + ranker + per-session state machines
// - Ingestion: bounded queue, dedicated writer thread, batched transactions
// - Maintenance: WAL checkpoints, retention pruning, FTS upkeep, vacuum
// - Recovery: corrupt stores are rotated aside and re-opened fresh

use anyhow::{Context, Result};
use clai::config::{self, Config};
use clai::events::CommandEvent;
use clai::lock::DaemonLock;
use clai::{cli, logging, Engine};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> Result<()> {
    // Handle CLI subcommands first (config --show, hook, ...).
    // If a command was handled, exit early.
    if cli::handle_cli() {
        return Ok(());
    }

    // Ensure the config template exists (helps users discover options).
    Config::ensure_config_exists();

    let config = Config::from_env();
    let _log_guard = logging::init(&config);
    tracing::info!(
        "clai-daemon {} starting (data dir: {})",
        config::VERSION,
        config.data_dir.display()
    );

    // One daemon per data directory; fail fast when another holds the lock.
    let _daemon_lock = DaemonLock::acquire(&config.data_dir, Duration::from_secs(5))
        .context("another clai-daemon instance is already running")?;

    let engine = Engine::open(config).context("failed to open the suggestion engine")?;

    // Feed NDJSON events from stdin until EOF or Ctrl+C. Ingest failures
    // are silent by design: the shell prompt must never pay for ours.
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match CommandEvent::from_json_line(&line) {
                        Ok(event) => {
                            let _ = engine.record_event(event);
                        }
                        Err(e) => tracing::debug!("ignoring malformed event line: {e}"),
                    }
                }
                Ok(None) => {
                    tracing::info!("stdin closed");
                    break;
                }
                Err(e) => {
                    tracing::warn!("stdin error: {e}");
                    break;
                }
            }
        }
    }

    tracing::info!("shutting down...");
    engine.shutdown().await;
    tracing::info!("shutdown complete");
    Ok(())
}
