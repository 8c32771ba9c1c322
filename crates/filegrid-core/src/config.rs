//! filegrid.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default per-project maximum file size (40 MiB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 40 * 1024 * 1024;
/// Bytes worker 0 may own before it is moved out of process.
pub const DEFAULT_MOVE_OUT_OF_PROCESS_BYTES: u64 = 512 * 1024;
/// Bytes the least-loaded worker may own before another worker is spawned.
pub const DEFAULT_SPAWN_WORKER_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilegridConfig {
    pub scheduler: Option<SchedulerConfig>,
    pub health: Option<HealthConfig>,
    #[serde(default, rename = "project")]
    pub projects: Vec<ProjectConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub max_file_size: Option<u64>,
    pub max_worker_count: Option<usize>,
    pub inband_only: Option<bool>,
    pub move_out_of_process_bytes: Option<u64>,
    pub spawn_worker_bytes: Option<u64>,
    pub handshake_timeout: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthConfig {
    pub interval: Option<String>,
    pub timeout: Option<String>,
    pub unresponsive_threshold: Option<u32>,
}

/// Per-root override for nested projects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub root: PathBuf,
    pub max_file_size: Option<u64>,
}

/// Resolved pool-manager settings.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Upper bound on the number of workers, worker 0 included.
    pub max_worker_count: usize,
    /// Force every file onto worker 0 and never grow the pool.
    pub inband_only: bool,
    pub move_out_of_process_bytes: u64,
    pub spawn_worker_bytes: u64,
    pub handshake_timeout: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_worker_count: default_worker_count(),
            inband_only: false,
            move_out_of_process_bytes: DEFAULT_MOVE_OUT_OF_PROCESS_BYTES,
            spawn_worker_bytes: DEFAULT_SPAWN_WORKER_BYTES,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Resolved watchdog settings.
#[derive(Debug, Clone)]
pub struct HealthSettings {
    pub interval: Duration,
    /// Response-latency threshold for a single ping.
    pub timeout: Duration,
    /// Consecutive missed pings before the worker is declared unresponsive.
    pub unresponsive_threshold: u32,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(2),
            unresponsive_threshold: 3,
        }
    }
}

impl FilegridConfig {
    /// Read and parse a `filegrid.toml`.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FilegridConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Serialize back to TOML.
    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Default per-project file size limit in bytes.
    pub fn max_file_size(&self) -> u64 {
        self.scheduler
            .as_ref()
            .and_then(|s| s.max_file_size)
            .unwrap_or(DEFAULT_MAX_FILE_SIZE)
    }

    /// Scheduler settings with defaults filled in.
    pub fn scheduler_settings(&self) -> SchedulerSettings {
        let defaults = SchedulerSettings::default();
        let Some(s) = &self.scheduler else {
            return defaults;
        };
        SchedulerSettings {
            max_worker_count: s.max_worker_count.unwrap_or(defaults.max_worker_count).max(1),
            inband_only: s.inband_only.unwrap_or(defaults.inband_only),
            move_out_of_process_bytes: s
                .move_out_of_process_bytes
                .unwrap_or(defaults.move_out_of_process_bytes),
            spawn_worker_bytes: s.spawn_worker_bytes.unwrap_or(defaults.spawn_worker_bytes),
            handshake_timeout: s
                .handshake_timeout
                .as_deref()
                .and_then(parse_duration)
                .unwrap_or(defaults.handshake_timeout),
        }
    }

    /// Health settings with defaults filled in.
    pub fn health_settings(&self) -> HealthSettings {
        let defaults = HealthSettings::default();
        let Some(h) = &self.health else {
            return defaults;
        };
        HealthSettings {
            interval: h
                .interval
                .as_deref()
                .and_then(parse_duration)
                .unwrap_or(defaults.interval),
            timeout: h
                .timeout
                .as_deref()
                .and_then(parse_duration)
                .unwrap_or(defaults.timeout),
            unresponsive_threshold: h
                .unresponsive_threshold
                .unwrap_or(defaults.unresponsive_threshold)
                .max(1),
        }
    }
}

/// Parse `"500ms"` or `"2s"` into a [`Duration`].
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else {
        None
    }
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: FilegridConfig = toml::from_str("").unwrap();
        assert_eq!(config.max_file_size(), DEFAULT_MAX_FILE_SIZE);

        let scheduler = config.scheduler_settings();
        assert!(!scheduler.inband_only);
        assert_eq!(scheduler.spawn_worker_bytes, DEFAULT_SPAWN_WORKER_BYTES);
        assert!(scheduler.max_worker_count >= 1);

        let health = config.health_settings();
        assert_eq!(health.interval, Duration::from_secs(5));
        assert_eq!(health.unresponsive_threshold, 3);
    }

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[scheduler]
max_file_size = 1000
max_worker_count = 3
inband_only = true
move_out_of_process_bytes = 800
spawn_worker_bytes = 2000
handshake_timeout = "250ms"

[health]
interval = "1s"
timeout = "100ms"
unresponsive_threshold = 5

[[project]]
root = "/repo/vendor"
max_file_size = 50
"#;
        let config: FilegridConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.max_file_size(), 1000);
        assert_eq!(config.projects.len(), 1);
        assert_eq!(config.projects[0].max_file_size, Some(50));

        let scheduler = config.scheduler_settings();
        assert_eq!(scheduler.max_worker_count, 3);
        assert!(scheduler.inband_only);
        assert_eq!(scheduler.move_out_of_process_bytes, 800);
        assert_eq!(scheduler.handshake_timeout, Duration::from_millis(250));

        let health = config.health_settings();
        assert_eq!(health.timeout, Duration::from_millis(100));
        assert_eq!(health.unresponsive_threshold, 5);
    }

    #[test]
    fn zero_worker_count_is_clamped() {
        let config: FilegridConfig = toml::from_str("[scheduler]\nmax_worker_count = 0\n").unwrap();
        assert_eq!(config.scheduler_settings().max_worker_count, 1);
    }

    #[test]
    fn parse_duration_values() {
        assert_eq!(parse_duration("2s"), Some(Duration::from_secs(2)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration("5m"), None);
    }

    #[test]
    fn round_trips_through_toml() {
        let mut config = FilegridConfig::default();
        config.scheduler = Some(SchedulerConfig {
            max_worker_count: Some(2),
            ..SchedulerConfig::default()
        });
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("max_worker_count = 2"));
    }
}
