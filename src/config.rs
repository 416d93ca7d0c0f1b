//! Configuration management
//!
//! Telemetry settings are read from `config.toml` in the project config
//! directory, then overridden from `TOOLWATCH_*` environment variables.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::metrics::VarianceSettings;
use crate::monitor::MonitorSettings;
use crate::perf::{PerfMode, PerfSettings};
use crate::shipper::ShipperSettings;

/// Upper bound for flush intervals and timeouts (one day)
pub const MAX_INTERVAL_SECONDS: u64 = 86_400;

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Per-tool cache capacity: 0 disables tracking, -1 is unbounded
    #[serde(default = "default_limit")]
    pub default_limit: i64,
    /// Relative duration deviation that counts as variance
    #[serde(default = "default_variance_threshold")]
    pub variance_threshold: f64,
    /// Durations kept per tool for variance detection
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Baseline samples needed before variance is reported
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    /// Characters kept of the parameter digest in minimal samples
    #[serde(default = "default_params_digest_chars")]
    pub params_digest_chars: usize,
    /// Capacity overrides by tool name
    #[serde(default)]
    pub tool_limits: HashMap<String, i64>,
    #[serde(default)]
    pub optimization: OptimizationConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub exceptions: ExceptionsConfig,
    #[serde(default)]
    pub variance: ToggleConfig,
    #[serde(default)]
    pub performance: ToggleConfig,
    #[serde(default)]
    pub loki: LokiConfig,
}

fn default_limit() -> i64 {
    100
}

fn default_variance_threshold() -> f64 {
    0.2
}

fn default_window_size() -> usize {
    100
}

fn default_min_samples() -> usize {
    10
}

fn default_params_digest_chars() -> usize {
    100
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            variance_threshold: default_variance_threshold(),
            window_size: default_window_size(),
            min_samples: default_min_samples(),
            params_digest_chars: default_params_digest_chars(),
            tool_limits: HashMap::new(),
            optimization: OptimizationConfig::default(),
            storage: StorageConfig::default(),
            exceptions: ExceptionsConfig::default(),
            variance: ToggleConfig::default(),
            performance: ToggleConfig::default(),
            loki: LokiConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationConfig {
    /// Start in optimization mode (detailed samples)
    #[serde(default)]
    pub enabled: bool,
    /// Samples per tool after which it is flagged for optimization
    #[serde(default = "default_trigger_threshold")]
    pub trigger_threshold: u64,
}

fn default_trigger_threshold() -> u64 {
    1000
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            trigger_threshold: default_trigger_threshold(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Persist samples from a background thread
    #[serde(default = "default_true")]
    pub async_save: bool,
    /// Queue length that wakes the background writer
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_storage_flush_interval")]
    pub flush_interval_seconds: u64,
    /// Queued samples kept while writes fail; the oldest are dropped beyond it
    #[serde(default = "default_max_pending_samples")]
    pub max_pending_samples: usize,
    /// Directory for per-tool logs; defaults to `<data dir>/perf`
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    100
}

fn default_storage_flush_interval() -> u64 {
    30
}

fn default_max_pending_samples() -> usize {
    10_000
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            async_save: true,
            batch_size: default_batch_size(),
            flush_interval_seconds: default_storage_flush_interval(),
            max_pending_samples: default_max_pending_samples(),
            directory: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_size")]
    pub context_cache_size: i64,
    #[serde(default = "default_cache_size")]
    pub recent_records: i64,
    /// Keep a rendering of successful outputs with the tracked context
    #[serde(default)]
    pub track_outputs: bool,
    /// Install the process-wide panic hook
    #[serde(default = "default_true")]
    pub capture_panics: bool,
}

fn default_cache_size() -> i64 {
    100
}

impl Default for ExceptionsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            context_cache_size: default_cache_size(),
            recent_records: default_cache_size(),
            track_outputs: false,
            capture_panics: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToggleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for ToggleConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LokiConfig {
    /// Base URL of the log backend; lines are discarded when unset
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_job")]
    pub job: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_loki_flush_interval")]
    pub flush_interval_seconds: u64,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    /// Lines kept for retry before the oldest are dropped
    #[serde(default = "default_max_buffered_lines")]
    pub max_buffered_lines: usize,
}

fn default_job() -> String {
    "toolwatch".to_string()
}

fn default_loki_flush_interval() -> u64 {
    5
}

fn default_timeout() -> u64 {
    10
}

fn default_max_buffered_lines() -> usize {
    10_000
}

impl Default for LokiConfig {
    fn default() -> Self {
        Self {
            url: None,
            job: default_job(),
            tenant_id: None,
            batch_size: default_batch_size(),
            flush_interval_seconds: default_loki_flush_interval(),
            timeout_seconds: default_timeout(),
            max_buffered_lines: default_max_buffered_lines(),
        }
    }
}

impl TelemetryConfig {
    /// Load from the default path with environment overrides applied.
    /// A missing file yields the defaults.
    pub fn load() -> Result<Self> {
        let path = config_path()?;
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            debug!("No config file at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a config file without environment overrides
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: TelemetryConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Save configuration to the default path
    pub fn save(&self) -> Result<()> {
        self.save_to(&config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let parent = path.parent().context("Config path has no parent")?;
        std::fs::create_dir_all(parent).context("Failed to create config directory")?;

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Apply `TOOLWATCH_*` overrides read through `lookup`
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |key: &str, target: &mut bool| {
            if let Some(raw) = lookup(key) {
                match parse_bool(&raw) {
                    Some(value) => *target = value,
                    None => warn!("Ignoring {}={:?}: expected a boolean", key, raw),
                }
            }
        };

        flag("TOOLWATCH_EXCEPTIONS", &mut self.exceptions.enabled);
        flag("TOOLWATCH_VARIANCE", &mut self.variance.enabled);
        flag("TOOLWATCH_PERFORMANCE", &mut self.performance.enabled);
        flag("TOOLWATCH_OPTIMIZATION", &mut self.optimization.enabled);
        flag("TOOLWATCH_ASYNC_SAVE", &mut self.storage.async_save);

        if let Some(url) = lookup("TOOLWATCH_LOKI_URL") {
            let url = url.trim().to_string();
            self.loki.url = if url.is_empty() { None } else { Some(url) };
        }
        if let Some(dir) = lookup("TOOLWATCH_STORAGE_DIR") {
            if !dir.trim().is_empty() {
                self.storage.directory = Some(PathBuf::from(dir));
            }
        }
    }

    /// Reject settings the components cannot work with
    pub fn validate(&self) -> Result<()> {
        if !(self.variance_threshold > 0.0) {
            bail!("variance_threshold must be positive, got {}", self.variance_threshold);
        }
        if self.window_size == 0 {
            bail!("window_size must be at least 1");
        }
        if self.min_samples > self.window_size {
            bail!(
                "min_samples ({}) cannot exceed window_size ({})",
                self.min_samples,
                self.window_size
            );
        }
        if self.storage.batch_size == 0 || self.loki.batch_size == 0 {
            bail!("batch sizes must be at least 1");
        }
        let intervals = [
            ("storage.flush_interval_seconds", self.storage.flush_interval_seconds),
            ("loki.flush_interval_seconds", self.loki.flush_interval_seconds),
            ("loki.timeout_seconds", self.loki.timeout_seconds),
        ];
        for (name, seconds) in intervals {
            if seconds == 0 || seconds > MAX_INTERVAL_SECONDS {
                bail!("{} must be between 1 and {}, got {}", name, MAX_INTERVAL_SECONDS, seconds);
            }
        }
        if self.loki.max_buffered_lines == 0 {
            bail!("loki.max_buffered_lines must be at least 1");
        }
        if self.storage.max_pending_samples == 0 {
            bail!("storage.max_pending_samples must be at least 1");
        }
        let limits = [
            ("default_limit", self.default_limit),
            ("exceptions.context_cache_size", self.exceptions.context_cache_size),
            ("exceptions.recent_records", self.exceptions.recent_records),
        ];
        for (name, limit) in limits {
            if limit < -1 {
                bail!("{} must be -1, 0 or positive, got {}", name, limit);
            }
        }
        for (tool, limit) in &self.tool_limits {
            if *limit < -1 {
                bail!("tool_limits.{} must be -1, 0 or positive, got {}", tool, limit);
            }
        }
        Ok(())
    }

    /// Directory holding per-tool performance logs
    pub fn storage_directory(&self) -> Result<PathBuf> {
        match &self.storage.directory {
            Some(dir) => Ok(dir.clone()),
            None => Ok(data_dir()?.join("perf")),
        }
    }

    pub fn shipper_settings(&self) -> ShipperSettings {
        ShipperSettings {
            job: self.loki.job.clone(),
            batch_size: self.loki.batch_size,
            max_buffered_lines: self.loki.max_buffered_lines,
        }
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            context_cache_size: self.exceptions.context_cache_size,
            recent_records: self.exceptions.recent_records,
            track_outputs: self.exceptions.track_outputs,
        }
    }

    pub fn variance_settings(&self) -> VarianceSettings {
        VarianceSettings {
            threshold: self.variance_threshold,
            window_size: self.window_size,
            min_samples: self.min_samples,
        }
    }

    pub fn perf_settings(&self) -> Result<PerfSettings> {
        Ok(PerfSettings {
            mode: if self.optimization.enabled {
                PerfMode::Optimization
            } else {
                PerfMode::Normal
            },
            default_limit: self.default_limit,
            tool_limits: self.tool_limits.clone(),
            params_digest_chars: self.params_digest_chars,
            storage_dir: self.storage_directory()?,
            async_save: self.storage.async_save,
            batch_size: self.storage.batch_size,
            flush_interval: Duration::from_secs(self.storage.flush_interval_seconds),
            max_pending: self.storage.max_pending_samples,
            trigger_threshold: self.optimization.trigger_threshold,
        })
    }

    pub fn loki_timeout(&self) -> Duration {
        Duration::from_secs(self.loki.timeout_seconds)
    }

    pub fn loki_flush_interval(&self) -> Duration {
        Duration::from_secs(self.loki.flush_interval_seconds)
    }
}

/// `1/0`, `true/false`, `yes/no`, `on/off`, case-insensitive
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn project_dirs() -> Result<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "toolwatch", "toolwatch")
        .context("Failed to get project directories")
}

/// Get the configuration file path
pub fn config_path() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().join("config.toml"))
}

/// Get the data directory path
pub fn data_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}

/// Get default configuration as TOML string
pub fn default_config_toml() -> String {
    let config = TelemetryConfig::default();
    toml::to_string_pretty(&config).unwrap_or_else(|_| "# Default configuration\n".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = TelemetryConfig::default();
        assert_eq!(config.default_limit, 100);
        assert_eq!(config.variance_threshold, 0.2);
        assert_eq!(config.window_size, 100);
        assert_eq!(config.min_samples, 10);
        assert!(config.exceptions.enabled);
        assert!(!config.optimization.enabled);
        assert!(config.storage.async_save);
        assert_eq!(config.storage.flush_interval_seconds, 30);
        assert!(config.loki.url.is_none());
        assert_eq!(config.loki.max_buffered_lines, 10_000);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config = TelemetryConfig::from_toml_str(
            r#"
            default_limit = -1
            min_samples = 5

            [tool_limits]
            search = 10

            [loki]
            url = "http://loki:3100"
            tenant_id = "team-a"

            [exceptions]
            track_outputs = true
            "#,
        )
        .unwrap();
        assert_eq!(config.default_limit, -1);
        assert_eq!(config.min_samples, 5);
        assert_eq!(config.window_size, 100);
        assert_eq!(config.tool_limits.get("search"), Some(&10));
        assert_eq!(config.loki.url.as_deref(), Some("http://loki:3100"));
        assert_eq!(config.loki.job, "toolwatch");
        assert!(config.exceptions.track_outputs);
        assert!(config.exceptions.capture_panics);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = TelemetryConfig::default();
        config.apply_env_overrides(env(&[
            ("TOOLWATCH_EXCEPTIONS", "off"),
            ("TOOLWATCH_OPTIMIZATION", "1"),
            ("TOOLWATCH_ASYNC_SAVE", "No"),
            ("TOOLWATCH_VARIANCE", "maybe"),
            ("TOOLWATCH_LOKI_URL", "http://localhost:3100"),
            ("TOOLWATCH_STORAGE_DIR", "/tmp/perf"),
        ]));
        assert!(!config.exceptions.enabled);
        assert!(config.optimization.enabled);
        assert!(!config.storage.async_save);
        // Unparseable values leave the setting alone
        assert!(config.variance.enabled);
        assert_eq!(config.loki.url.as_deref(), Some("http://localhost:3100"));
        assert_eq!(config.storage_directory().unwrap(), PathBuf::from("/tmp/perf"));
        assert_eq!(config.perf_settings().unwrap().mode, PerfMode::Optimization);
    }

    #[test]
    fn test_validation() {
        let mut config = TelemetryConfig::default();
        config.min_samples = 200;
        assert!(config.validate().is_err());

        let mut config = TelemetryConfig::default();
        config.variance_threshold = 0.0;
        assert!(config.validate().is_err());

        let mut config = TelemetryConfig::default();
        config.tool_limits.insert("x".to_string(), -2);
        assert!(config.validate().is_err());

        let mut config = TelemetryConfig::default();
        config.loki.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = TelemetryConfig::default();
        config.storage.max_pending_samples = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_intervals_are_bounded() {
        let mut config = TelemetryConfig::default();
        config.storage.flush_interval_seconds = u64::MAX;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("storage.flush_interval_seconds"));

        let mut config = TelemetryConfig::default();
        config.loki.flush_interval_seconds = MAX_INTERVAL_SECONDS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = TelemetryConfig::default();
        config.loki.url = Some("http://loki:3100".to_string());
        config.tool_limits.insert("search".to_string(), 5);
        config.save_to(&path).unwrap();

        assert_eq!(TelemetryConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_default_toml_parses() {
        let parsed = TelemetryConfig::from_toml_str(&default_config_toml()).unwrap();
        assert_eq!(parsed, TelemetryConfig::default());
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool(" TRUE "), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool(""), None);
    }
}
