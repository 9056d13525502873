// Configuration for the suggestion engine
//
// Configuration is loaded in order of precedence:
// 1. Environment variables (highest priority)
// 2. Config file (~/.config/clai/config.toml)
// 3. Built-in defaults (lowest priority)

use crate::cadence::CadenceConfig;
use crate::ingest::IngestConfig;
use crate::maintenance::MaintenanceConfig;
use crate::rank::RankConfig;
use crate::store::StoreOptions;
use crate::workflow::WorkflowConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Also write logs to `<data_dir>/logs/` with daily rotation
    pub file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: true,
        }
    }
}

/// Ingestion pipeline settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestSettings {
    /// Queue capacity; new events are dropped when full
    pub queue_capacity: usize,
    /// Events per flush transaction
    pub batch_size: usize,
    /// Flush interval in milliseconds (25-50 is the useful range)
    pub flush_interval_ms: u64,
    /// Byte cap on stored commands
    pub max_cmd_bytes: usize,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 500,
            batch_size: 100,
            flush_interval_ms: 40,
            max_cmd_bytes: 4096,
        }
    }
}

/// Scoring decay settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScoringSettings {
    /// Exponential decay half-life in days
    pub half_life_days: u32,
}

impl Default for ScoringSettings {
    fn default() -> Self {
        Self { half_life_days: 14 }
    }
}

/// Ranker settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RankSettings {
    /// Internal deadline for the suggestion hot path
    pub deadline_ms: u64,
    /// Default result cap when the caller does not specify one
    pub max_results: usize,
}

impl Default for RankSettings {
    fn default() -> Self {
        Self {
            deadline_ms: 50,
            max_results: 10,
        }
    }
}

/// Typing-cadence thresholds (milliseconds)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CadenceSettings {
    pub fast_ms: i64,
    pub pause_ms: i64,
    pub idle_timeout_ms: i64,
}

impl Default for CadenceSettings {
    fn default() -> Self {
        Self {
            fast_ms: 100,
            pause_ms: 300,
            idle_timeout_ms: 2000,
        }
    }
}

/// Workflow tracker settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkflowSettings {
    pub stale_after: u32,
    pub activation_timeout_ms: i64,
    pub max_candidates: usize,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            stale_after: 5,
            activation_timeout_ms: 600_000,
            max_candidates: 3,
        }
    }
}

/// Maintenance loop settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MaintenanceSettings {
    pub interval_secs: u64,
    /// Retention period in days (0 = forever)
    pub retention_days: u32,
    /// Events per tick below which the store counts as quiet
    pub low_activity_threshold: u64,
    /// Vacuum when the file grew by this factor since the last vacuum
    pub vacuum_growth: f64,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            retention_days: 90,
            low_activity_threshold: 5,
            vacuum_growth: 2.0,
        }
    }
}

/// Recovery behavior
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoverySettings {
    /// Rotate corrupt stores aside and re-open fresh
    pub enabled: bool,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory holding the store, lock file and logs
    pub data_dir: PathBuf,
    /// In-memory session state eviction threshold
    pub session_idle_ms: i64,
    pub logging: LoggingConfig,
    pub ingest: IngestSettings,
    pub scoring: ScoringSettings,
    pub rank: RankSettings,
    pub cadence: CadenceSettings,
    pub workflow: WorkflowSettings,
    pub maintenance: MaintenanceSettings,
    pub recovery: RecoverySettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            session_idle_ms: 30 * 60 * 1000,
            logging: LoggingConfig::default(),
            ingest: IngestSettings::default(),
            scoring: ScoringSettings::default(),
            rank: RankSettings::default(),
            cadence: CadenceSettings::default(),
            workflow: WorkflowSettings::default(),
            maintenance: MaintenanceSettings::default(),
            recovery: RecoverySettings::default(),
        }
    }
}

impl Config {
    /// Load configuration: env > file > defaults.
    pub fn from_env() -> Self {
        let mut config = Self::load_file().unwrap_or_default();
        config.apply_env_overrides();
        config
    }

    fn load_file() -> Option<Self> {
        let path = Self::config_path()?;
        let raw = std::fs::read_to_string(&path).ok()?;
        match toml::from_str(&raw) {
            Ok(config) => Some(config),
            Err(e) => {
                eprintln!("warning: ignoring malformed config {}: {e}", path.display());
                None
            }
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("CLAI_DATA_DIR") {
            if !dir.is_empty() {
                self.data_dir = PathBuf::from(dir);
            }
        }
        if let Ok(level) = std::env::var("CLAI_LOG_LEVEL") {
            if !level.is_empty() {
                self.logging.level = level;
            }
        }
        if let Ok(days) = std::env::var("CLAI_RETENTION_DAYS") {
            if let Ok(days) = days.parse() {
                self.maintenance.retention_days = days;
            }
        }
    }

    /// Path of the config file: `~/.config/clai/config.toml`
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("clai").join("config.toml"))
    }

    /// Write the commented default template if no config file exists yet.
    pub fn ensure_config_exists() {
        let Some(path) = Self::config_path() else {
            return;
        };
        if path.exists() {
            return;
        }
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = std::fs::write(&path, Self::default().to_toml());
    }

    /// Render the effective configuration as a commented TOML document.
    pub fn to_toml(&self) -> String {
        format!(
            r#"# clai configuration
# Precedence: environment variables > this file > built-in defaults.

# Data directory holding suggestions.db, the daemon lock and logs.
data_dir = {data_dir:?}

# Release in-memory session state after this much inactivity (ms).
session_idle_ms = {session_idle_ms}

[logging]
# trace, debug, info, warn, error
level = {level:?}
# Also write logs to <data_dir>/logs/ with daily rotation.
file = {log_file}

[ingest]
queue_capacity = {queue_capacity}
batch_size = {batch_size}
flush_interval_ms = {flush_interval_ms}
max_cmd_bytes = {max_cmd_bytes}

[scoring]
half_life_days = {half_life_days}

[rank]
deadline_ms = {deadline_ms}
max_results = {max_results}

[cadence]
fast_ms = {fast_ms}
pause_ms = {pause_ms}
idle_timeout_ms = {idle_timeout_ms}

[workflow]
stale_after = {stale_after}
activation_timeout_ms = {activation_timeout_ms}
max_candidates = {max_candidates}

[maintenance]
interval_secs = {interval_secs}
# 0 keeps history forever.
retention_days = {retention_days}
low_activity_threshold = {low_activity_threshold}
vacuum_growth = {vacuum_growth}

[recovery]
enabled = {recovery_enabled}
"#,
            data_dir = self.data_dir.display().to_string(),
            session_idle_ms = self.session_idle_ms,
            level = self.logging.level,
            log_file = self.logging.file,
            queue_capacity = self.ingest.queue_capacity,
            batch_size = self.ingest.batch_size,
            flush_interval_ms = self.ingest.flush_interval_ms,
            max_cmd_bytes = self.ingest.max_cmd_bytes,
            half_life_days = self.scoring.half_life_days,
            deadline_ms = self.rank.deadline_ms,
            max_results = self.rank.max_results,
            fast_ms = self.cadence.fast_ms,
            pause_ms = self.cadence.pause_ms,
            idle_timeout_ms = self.cadence.idle_timeout_ms,
            stale_after = self.workflow.stale_after,
            activation_timeout_ms = self.workflow.activation_timeout_ms,
            max_candidates = self.workflow.max_candidates,
            interval_secs = self.maintenance.interval_secs,
            retention_days = self.maintenance.retention_days,
            low_activity_threshold = self.maintenance.low_activity_threshold,
            vacuum_growth = self.maintenance.vacuum_growth,
            recovery_enabled = self.recovery.enabled,
        )
    }

    // ── Typed views for the subsystems ──────────────────────────────────

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("suggestions.db")
    }

    pub fn half_life_ms(&self) -> i64 {
        i64::from(self.scoring.half_life_days) * 86_400_000
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            recover_on_corruption: self.recovery.enabled,
            ..StoreOptions::default()
        }
    }

    pub fn ingest_config(&self) -> IngestConfig {
        IngestConfig {
            queue_capacity: self.ingest.queue_capacity,
            batch_size: self.ingest.batch_size,
            flush_interval: Duration::from_millis(self.ingest.flush_interval_ms),
            half_life_ms: self.half_life_ms(),
            max_cmd_bytes: self.ingest.max_cmd_bytes,
            ..IngestConfig::default()
        }
    }

    pub fn rank_config(&self) -> RankConfig {
        RankConfig {
            deadline: Duration::from_millis(self.rank.deadline_ms),
            half_life_ms: self.half_life_ms(),
            ..RankConfig::default()
        }
    }

    pub fn cadence_config(&self) -> CadenceConfig {
        CadenceConfig {
            fast_ms: self.cadence.fast_ms,
            pause_ms: self.cadence.pause_ms,
            idle_timeout_ms: self.cadence.idle_timeout_ms,
        }
    }

    pub fn workflow_config(&self) -> WorkflowConfig {
        WorkflowConfig {
            stale_after: self.workflow.stale_after,
            activation_timeout_ms: self.workflow.activation_timeout_ms,
            max_candidates: self.workflow.max_candidates,
        }
    }

    pub fn maintenance_config(&self) -> MaintenanceConfig {
        MaintenanceConfig {
            interval: Duration::from_secs(self.maintenance.interval_secs),
            retention_days: self.maintenance.retention_days,
            low_activity_threshold: self.maintenance.low_activity_threshold,
            vacuum_growth: self.maintenance.vacuum_growth,
            ..MaintenanceConfig::default()
        }
    }
}

/// Default data directory: `~/.local/share/clai` (platform equivalent).
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("clai")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_built_in_defaults() {
        let config = Config::default();
        assert_eq!(config.ingest.queue_capacity, 500);
        assert_eq!(config.ingest.batch_size, 100);
        assert!(config.ingest.flush_interval_ms >= 25 && config.ingest.flush_interval_ms <= 50);
        assert_eq!(config.scoring.half_life_days, 14);
        assert_eq!(config.rank.deadline_ms, 50);
        assert_eq!(config.cadence.fast_ms, 100);
        assert_eq!(config.cadence.pause_ms, 300);
        assert_eq!(config.cadence.idle_timeout_ms, 2000);
        assert_eq!(config.workflow.stale_after, 5);
        assert_eq!(config.workflow.max_candidates, 3);
        assert_eq!(config.maintenance.interval_secs, 300);
        assert_eq!(config.maintenance.low_activity_threshold, 5);
        assert!(config.recovery.enabled);
    }

    #[test]
    fn test_template_round_trips_through_toml() {
        let config = Config::default();
        let parsed: Config = toml::from_str(&config.to_toml()).expect("template parses");
        assert_eq!(parsed.ingest.queue_capacity, config.ingest.queue_capacity);
        assert_eq!(parsed.logging.level, config.logging.level);
        assert_eq!(parsed.maintenance.retention_days, config.maintenance.retention_days);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [ingest]
            queue_capacity = 64
            "#,
        )
        .unwrap();
        assert_eq!(parsed.ingest.queue_capacity, 64);
        assert_eq!(parsed.ingest.batch_size, 100, "unset fields take defaults");
        assert_eq!(parsed.rank.deadline_ms, 50);
    }

    #[test]
    fn test_half_life_conversion() {
        let config = Config::default();
        assert_eq!(config.half_life_ms(), 14 * 86_400_000);
    }

    #[test]
    fn test_db_path_under_data_dir() {
        let mut config = Config::default();
        config.data_dir = PathBuf::from("/tmp/clai-test");
        assert_eq!(
            config.db_path(),
            PathBuf::from("/tmp/clai-test/suggestions.db")
        );
    }
}
