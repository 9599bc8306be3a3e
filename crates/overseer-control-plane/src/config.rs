//! Control plane configuration.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Enable flag and tick interval for one scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ScannerConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl ScannerConfig {
    pub const fn new(enabled: bool, interval_secs: u64) -> Self {
        Self {
            enabled,
            interval_secs,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Per-scanner settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScannersConfig {
    pub pending_tasks: ScannerConfig,
    pub stuck_agents: ScannerConfig,
    pub qa_verification: ScannerConfig,
    pub resources: ScannerConfig,
    pub reconciler: ScannerConfig,
    /// `interval_secs` is the planning period.
    pub planning: ScannerConfig,
    /// `interval_secs` is the cleanup period.
    pub cleanup: ScannerConfig,
    /// How often the planning and cleanup triggers check whether they are due.
    pub trigger_check_secs: u64,
}

impl Default for ScannersConfig {
    fn default() -> Self {
        Self {
            pending_tasks: ScannerConfig::new(true, 10),
            stuck_agents: ScannerConfig::new(true, 60),
            qa_verification: ScannerConfig::new(true, 300),
            resources: ScannerConfig::new(true, 30),
            reconciler: ScannerConfig::new(true, 300),
            planning: ScannerConfig::new(false, 3600),
            cleanup: ScannerConfig::new(false, 86_400),
            trigger_check_secs: 60,
        }
    }
}

/// Upper bound for heartbeat age thresholds (30 days).
const MAX_AGE_MINUTES: i64 = 30 * 24 * 60;

/// Staleness windows, batch sizes and resource limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Heartbeat age after which a working agent is reported stuck.
    pub stuck_agent_minutes: i64,
    /// Heartbeat age after which a task-less working agent is reset.
    pub stale_working_minutes: i64,
    /// Minimum gap between two `task:pending` emissions for one task.
    pub pending_debounce_secs: u64,
    /// Maximum `task:pending` emissions per cycle.
    pub pending_batch: usize,
    /// Maximum `task:ready_for_qa` emissions per cycle.
    pub qa_batch: usize,
    /// Consecutive misaligned reconcile cycles before a session is terminated.
    pub orphan_mismatch_cycles: u32,
    pub cpu_high_percent: f32,
    pub memory_high_percent: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            stuck_agent_minutes: 15,
            stale_working_minutes: 20,
            pending_debounce_secs: 30,
            pending_batch: 5,
            qa_batch: 3,
            orphan_mismatch_cycles: 2,
            cpu_high_percent: 90.0,
            memory_high_percent: 90.0,
        }
    }
}

/// How agent processes are started.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    /// Executable to run per task. Without one, launches always fail.
    pub command: Option<String>,
    pub args: Vec<String>,
    /// Model hint passed to the agent.
    pub model: Option<String>,
    /// Wall-clock limit for one agent process (seconds).
    pub timeout_secs: Option<u64>,
}

impl LauncherConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Control plane configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum number of agents working at once.
    pub max_concurrent: usize,

    pub launcher: LauncherConfig,

    pub scanners: ScannersConfig,

    pub thresholds: Thresholds,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            launcher: LauncherConfig::default(),
            scanners: ScannersConfig::default(),
            thresholds: Thresholds::default(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::Invalid("max_concurrent must be at least 1".into()));
        }
        if self.thresholds.orphan_mismatch_cycles == 0 {
            return Err(ConfigError::Invalid(
                "orphan_mismatch_cycles must be at least 1".into(),
            ));
        }
        for (name, minutes) in [
            ("stuck_agent_minutes", self.thresholds.stuck_agent_minutes),
            ("stale_working_minutes", self.thresholds.stale_working_minutes),
        ] {
            if !(1..=MAX_AGE_MINUTES).contains(&minutes) {
                return Err(ConfigError::Invalid(format!(
                    "thresholds.{name} must be between 1 and {MAX_AGE_MINUTES}"
                )));
            }
        }
        if self.scanners.trigger_check_secs == 0 {
            return Err(ConfigError::Invalid("trigger_check_secs must be positive".into()));
        }
        let scanners = &self.scanners;
        for (name, scanner) in [
            ("pending_tasks", scanners.pending_tasks),
            ("stuck_agents", scanners.stuck_agents),
            ("qa_verification", scanners.qa_verification),
            ("resources", scanners.resources),
            ("reconciler", scanners.reconciler),
            ("planning", scanners.planning),
            ("cleanup", scanners.cleanup),
        ] {
            if scanner.interval_secs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "scanners.{name}.interval_secs must be positive"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: Config = serde_json::from_str(
            r#"{ "max_concurrent": 8, "scanners": { "planning": { "enabled": true, "interval_secs": 1800 } } }"#,
        )
        .unwrap();

        assert_eq!(config.max_concurrent, 8);
        assert!(config.scanners.planning.enabled);
        assert_eq!(config.scanners.planning.interval_secs, 1800);
        assert_eq!(config.scanners.reconciler.interval_secs, 300);
        assert_eq!(config.thresholds.stuck_agent_minutes, 15);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = Config {
            max_concurrent: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_heartbeat_thresholds_range_checked() {
        for minutes in [0, -5, MAX_AGE_MINUTES + 1, i64::MAX] {
            let mut config = Config::default();
            config.thresholds.stuck_agent_minutes = minutes;
            assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))), "{minutes}");

            let mut config = Config::default();
            config.thresholds.stale_working_minutes = minutes;
            assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))), "{minutes}");
        }

        let mut config = Config::default();
        config.thresholds.stuck_agent_minutes = MAX_AGE_MINUTES;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = Config::from_file("/nonexistent/overseer.json").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/overseer.json"));
    }
}
