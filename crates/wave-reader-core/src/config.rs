//! Configuration management for wave-reader
//!
//! Handles loading and validation of `wave-reader.toml`. Every field has a
//! default so a missing file or a partial file both yield a usable config.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::router::Priority;

/// Environment variable that points at an explicit config file.
pub const CONFIG_ENV_VAR: &str = "WAVE_READER_CONFIG";

const CONFIG_FILE_NAME: &str = "wave-reader.toml";

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings (logging)
    pub general: GeneralConfig,
    /// Background dispatcher settings
    pub dispatcher: DispatcherConfig,
    /// Content-script delivery settings
    pub transport: TransportConfig,
    /// Priority router settings
    pub router: RouterConfig,
    /// Health thresholds and ticker cadence
    pub health: HealthConfig,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output for interactive use
    #[default]
    Pretty,
    /// JSON lines for machine consumption
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected one of: pretty, json")),
        }
    }
}

/// General configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
    /// Optional log file
    pub log_file: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            log_file: None,
        }
    }
}

/// Background dispatcher configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Rolling inbound message history length
    pub history_capacity: usize,
    /// Default number of entries returned by `message-history`
    pub history_view_limit: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1000,
            history_view_limit: 50,
        }
    }
}

/// Content-script delivery configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Wait after injection before the single retry (ms)
    pub injection_delay_ms: u64,
    /// Receiver script that must be injected for delivery to work
    pub receiver_script: String,
    /// Secondary scripts; injection failures are logged and ignored
    pub optional_scripts: Vec<String>,
    /// URL prefixes that can never host a content script
    pub restricted_prefixes: Vec<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            injection_delay_ms: 100,
            receiver_script: "content.js".to_string(),
            optional_scripts: vec!["wave-styles.js".to_string()],
            restricted_prefixes: [
                "chrome://",
                "chrome-extension://",
                "moz-extension://",
                "edge://",
                "about:",
            ]
            .iter()
            .map(|p| (*p).to_string())
            .collect(),
        }
    }
}

impl TransportConfig {
    /// Post-injection delay as a `Duration`.
    pub fn injection_delay(&self) -> Duration {
        Duration::from_millis(self.injection_delay_ms)
    }
}

/// Priority router configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Rolling routed-message history length
    pub history_capacity: usize,
    /// Per-target processing-time samples kept for averages
    pub metrics_samples: usize,
    /// Suggested cadence for external `drain_queues` calls (ms)
    pub drain_interval_ms: u64,
    /// Base delay for `send_with_retry` backoff (ms)
    pub retry_base_delay_ms: u64,
    /// Advisory per-priority timeouts (ms); not enforced
    pub timeouts: PriorityTimeouts,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1000,
            metrics_samples: 100,
            drain_interval_ms: 100,
            retry_base_delay_ms: 100,
            timeouts: PriorityTimeouts::default(),
        }
    }
}

/// Advisory processing timeouts per priority tier (ms)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityTimeouts {
    pub critical_ms: u64,
    pub high_ms: u64,
    pub normal_ms: u64,
    pub low_ms: u64,
}

impl Default for PriorityTimeouts {
    fn default() -> Self {
        Self {
            critical_ms: 1_000,
            high_ms: 5_000,
            normal_ms: 10_000,
            low_ms: 30_000,
        }
    }
}

impl PriorityTimeouts {
    pub fn for_priority(&self, priority: Priority) -> Duration {
        let ms = match priority {
            Priority::Critical => self.critical_ms,
            Priority::High => self.high_ms,
            Priority::Normal => self.normal_ms,
            Priority::Low => self.low_ms,
        };
        Duration::from_millis(ms)
    }
}

/// Health thresholds and ticker cadence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Status recompute interval (seconds)
    pub check_interval_secs: u64,
    /// Summary log interval (seconds)
    pub log_interval_secs: u64,
    /// Error rate above which the dispatcher is degraded
    pub degraded_error_rate: f64,
    /// Error rate above which the dispatcher is unhealthy
    pub unhealthy_error_rate: f64,
    /// Heartbeat age above which the dispatcher is degraded (seconds)
    pub degraded_heartbeat_secs: u64,
    /// Heartbeat age above which the dispatcher is unhealthy (seconds)
    pub unhealthy_heartbeat_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            log_interval_secs: 300,
            degraded_error_rate: 0.05,
            unhealthy_error_rate: 0.10,
            degraded_heartbeat_secs: 30,
            unhealthy_heartbeat_secs: 60,
        }
    }
}

impl HealthConfig {
    /// Check period; at least one second.
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    /// Summary period; at least one second.
    pub fn log_interval(&self) -> Duration {
        Duration::from_secs(self.log_interval_secs.max(1))
    }
}

/// Resolve the config path: explicit argument, then `WAVE_READER_CONFIG`,
/// then the platform config directory.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    dirs::config_dir().map(|dir| dir.join("wave-reader").join(CONFIG_FILE_NAME))
}

impl Config {
    /// Load configuration from the resolved location.
    ///
    /// An explicitly requested file must exist; the default location is
    /// optional and falls back to built-in defaults.
    pub fn load(explicit: Option<&Path>) -> crate::Result<Self> {
        let explicit_requested = explicit.is_some() || std::env::var_os(CONFIG_ENV_VAR).is_some();
        match resolve_config_path(explicit) {
            Some(path) if path.exists() => Self::load_from(&path),
            Some(path) if explicit_requested => {
                Err(ConfigError::FileNotFound(path.display().to_string()).into())
            }
            _ => {
                tracing::debug!("No config file found; using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        let config = Self::from_toml(&content)?;
        tracing::debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render the config back to TOML.
    pub fn to_toml(&self) -> crate::Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeFailed(e.to_string()).into())
    }

    /// Reject values that would break bounded buffers or health math.
    pub fn validate(&self) -> crate::Result<()> {
        let fail = |msg: &str| -> crate::Result<()> {
            Err(ConfigError::ValidationError(msg.to_string()).into())
        };

        if self.dispatcher.history_capacity == 0 {
            return fail("dispatcher.history_capacity must be > 0");
        }
        if self.router.history_capacity == 0 {
            return fail("router.history_capacity must be > 0");
        }
        if self.router.metrics_samples == 0 {
            return fail("router.metrics_samples must be > 0");
        }
        if self.router.drain_interval_ms == 0 {
            return fail("router.drain_interval_ms must be > 0");
        }
        if self.transport.receiver_script.trim().is_empty() {
            return fail("transport.receiver_script must not be empty");
        }
        let health = &self.health;
        if !(0.0..=1.0).contains(&health.degraded_error_rate)
            || !(0.0..=1.0).contains(&health.unhealthy_error_rate)
        {
            return fail("health error rates must be within 0.0..=1.0");
        }
        if health.degraded_error_rate > health.unhealthy_error_rate {
            return fail("health.degraded_error_rate must not exceed unhealthy_error_rate");
        }
        if health.degraded_heartbeat_secs > health.unhealthy_heartbeat_secs {
            return fail("health.degraded_heartbeat_secs must not exceed unhealthy_heartbeat_secs");
        }
        if health.check_interval_secs == 0 || health.log_interval_secs == 0 {
            return fail("health intervals must be > 0");
        }
        Ok(())
    }
}
