//! Configuration loading and validation for the PAP core.
//!
//! Configuration is read from a TOML file; every field has a default, so an
//! empty file is a valid configuration.
//!
//! # Configuration Sections
//!
//! | Section | Description |
//! |---------|-------------|
//! | `pdp` | Heartbeat cadence, message age limit, per-kind retry parameters |
//! | `topics` | Names of the PDP and notification topics |
//! | `logging` | Log level, format, and colors |
//! | `shutdown` | Grace period for background tasks on stop |
//!
//! # Example Configuration
//!
//! ```toml
//! [pdp]
//! heartbeat_ms = 60000
//! max_message_age_ms = 600000
//! missed_heartbeat_threshold = 3
//!
//! [pdp.update]
//! max_retry_count = 1
//! max_wait_ms = 30000
//!
//! [topics]
//! pdp_topic = "POLICY-PDP-PAP"
//! notification_topic = "POLICY-NOTIFICATION"
//!
//! [logging]
//! level = "info"
//! format = "json"
//! ```
//!
//! # Environment Overrides
//!
//! - `PAP_PDP_HEARTBEAT_MS` - Heartbeat interval
//! - `PAP_PDP_MAX_MESSAGE_AGE_MS` - Maximum inbound status age
//! - `PAP_PDP_TOPIC` - PDP topic name
//! - `PAP_NOTIFICATION_TOPIC` - Notification topic name
//! - `PAP_LOG_LEVEL` - Log level (trace, debug, info, warn, error)
//! - `PAP_LOG_FORMAT` - Log format (text, json)

use std::path::Path;
use std::time::Duration;

use pap_comm::{CommConfig, RequestKindConfig};
use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PapConfig {
    /// PDP interaction parameters.
    #[serde(default)]
    pub pdp: PdpParameters,

    /// Message bus topics.
    #[serde(default)]
    pub topics: TopicsConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Shutdown behavior.
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

/// PDP interaction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PdpParameters {
    /// Heartbeat interval PDPs are told to use, and the tracker's pass interval.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,

    /// Inbound status messages older than this are discarded.
    #[serde(default = "default_max_message_age_ms")]
    pub max_message_age_ms: u64,

    /// Silent tracker passes before a PDP is probed.
    #[serde(default = "default_missed_heartbeat_threshold")]
    pub missed_heartbeat_threshold: u32,

    /// Whether silent PDPs are probed at all.
    #[serde(default = "default_true")]
    pub heartbeat_probe_enabled: bool,

    #[serde(default)]
    pub update: RequestParameters,

    #[serde(default)]
    pub state_change: RequestParameters,

    #[serde(default)]
    pub health_check: RequestParameters,
}

impl Default for PdpParameters {
    fn default() -> Self {
        Self {
            heartbeat_ms: default_heartbeat_ms(),
            max_message_age_ms: default_max_message_age_ms(),
            missed_heartbeat_threshold: default_missed_heartbeat_threshold(),
            heartbeat_probe_enabled: true,
            update: RequestParameters::default(),
            state_change: RequestParameters::default(),
            health_check: RequestParameters::default(),
        }
    }
}

fn default_heartbeat_ms() -> u64 {
    pap_comm::config::DEFAULT_HEARTBEAT_INTERVAL.as_millis() as u64
}

fn default_max_message_age_ms() -> u64 {
    pap_comm::config::DEFAULT_MAX_MESSAGE_AGE.as_millis() as u64
}

fn default_missed_heartbeat_threshold() -> u32 {
    pap_comm::config::DEFAULT_MISSED_HEARTBEAT_THRESHOLD
}

fn default_true() -> bool {
    true
}

/// Retry parameters for one message kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RequestParameters {
    /// Re-publications after the first send.
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,

    /// Wait for a response before re-publishing.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
}

impl Default for RequestParameters {
    fn default() -> Self {
        Self {
            max_retry_count: default_max_retry_count(),
            max_wait_ms: default_max_wait_ms(),
        }
    }
}

fn default_max_retry_count() -> u32 {
    pap_comm::config::DEFAULT_MAX_RETRY_COUNT
}

fn default_max_wait_ms() -> u64 {
    pap_comm::config::DEFAULT_MAX_WAIT.as_millis() as u64
}

impl RequestParameters {
    fn to_kind_config(self) -> RequestKindConfig {
        RequestKindConfig::new(self.max_retry_count, Duration::from_millis(self.max_wait_ms))
    }
}

/// Message bus topics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicsConfig {
    /// Topic carrying messages to PDPs and their status reports.
    #[serde(default = "default_pdp_topic")]
    pub pdp_topic: String,

    /// Topic carrying policy deployment notifications.
    #[serde(default = "default_notification_topic")]
    pub notification_topic: String,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            pdp_topic: default_pdp_topic(),
            notification_topic: default_notification_topic(),
        }
    }
}

fn default_pdp_topic() -> String {
    "POLICY-PDP-PAP".to_string()
}

fn default_notification_topic() -> String {
    "POLICY-NOTIFICATION".to_string()
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text or json).
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Whether to use ANSI colors.
    #[serde(default = "default_true")]
    pub colors: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// Shutdown behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// How long to wait for background tasks to exit.
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_ms: default_grace_ms(),
        }
    }
}

fn default_grace_ms() -> u64 {
    5000
}

impl PapConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides.
    ///
    /// Environment variables take precedence over file configuration.
    pub fn from_file_with_env(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        // PDP overrides
        if let Some(ms) = var("PAP_PDP_HEARTBEAT_MS").and_then(|v| v.parse().ok()) {
            self.pdp.heartbeat_ms = ms;
        }
        if let Some(ms) = var("PAP_PDP_MAX_MESSAGE_AGE_MS").and_then(|v| v.parse().ok()) {
            self.pdp.max_message_age_ms = ms;
        }

        // Topic overrides
        if let Some(val) = var("PAP_PDP_TOPIC") {
            self.topics.pdp_topic = val;
        }
        if let Some(val) = var("PAP_NOTIFICATION_TOPIC") {
            self.topics.notification_topic = val;
        }

        // Logging overrides
        if let Some(val) = var("PAP_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Some(val) = var("PAP_LOG_FORMAT") {
            self.logging.format = val;
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pdp.heartbeat_ms == 0 {
            anyhow::bail!("pdp.heartbeat_ms must be > 0");
        }
        if self.pdp.max_message_age_ms == 0 {
            anyhow::bail!("pdp.max_message_age_ms must be > 0");
        }
        if self.pdp.missed_heartbeat_threshold == 0 {
            anyhow::bail!("pdp.missed_heartbeat_threshold must be > 0");
        }
        for (name, params) in [
            ("update", &self.pdp.update),
            ("state_change", &self.pdp.state_change),
            ("health_check", &self.pdp.health_check),
        ] {
            if params.max_wait_ms == 0 {
                anyhow::bail!("pdp.{}.max_wait_ms must be > 0", name);
            }
        }

        if self.topics.pdp_topic.is_empty() || self.topics.notification_topic.is_empty() {
            anyhow::bail!("topic names must not be empty");
        }

        match self.logging.format.to_lowercase().as_str() {
            "text" | "json" => {}
            other => anyhow::bail!("Unknown log format: {}", other),
        }

        self.to_comm_config().validate()?;
        Ok(())
    }

    /// Dispatch engine parameters.
    pub fn to_comm_config(&self) -> CommConfig {
        CommConfig {
            heartbeat_interval: Duration::from_millis(self.pdp.heartbeat_ms),
            max_message_age: Duration::from_millis(self.pdp.max_message_age_ms),
            missed_heartbeat_threshold: self.pdp.missed_heartbeat_threshold,
            heartbeat_probe_enabled: self.pdp.heartbeat_probe_enabled,
            update: self.pdp.update.to_kind_config(),
            state_change: self.pdp.state_change.to_kind_config(),
            health_check: self.pdp.health_check.to_kind_config(),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown.grace_ms)
    }
}
