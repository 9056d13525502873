// Logging setup - tracing subscriber with optional rotating file output
//
// Precedence for the filter: RUST_LOG env var > config level > "info".
// File logging writes through a non-blocking appender with daily rotation
// under <data_dir>/logs/; the returned guard must stay alive for the
// process lifetime or buffered lines are lost.

use crate::config::Config;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global tracing subscriber. Returns the appender guard
/// when file logging is enabled.
pub fn init(config: &Config) -> Option<WorkerGuard> {
    let default_filter = format!("clai={}", config.logging.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    if config.logging.file {
        let appender =
            tracing_appender::rolling::daily(config.data_dir.join("logs"), "clai.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false),
            )
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
        None
    }
}
