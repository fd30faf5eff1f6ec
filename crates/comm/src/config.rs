//! Runtime parameters for the dispatch engine.

use std::time::Duration;

use crate::error::{CommError, Result};

/// Default number of re-publications before a request gives up.
pub const DEFAULT_MAX_RETRY_COUNT: u32 = 1;

/// Default time to wait for a response before re-publishing.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(30);

/// Default interval between heartbeat tracker passes.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Default age beyond which inbound status messages are discarded.
pub const DEFAULT_MAX_MESSAGE_AGE: Duration = Duration::from_secs(600);

/// Default number of silent passes before a PDP is probed.
pub const DEFAULT_MISSED_HEARTBEAT_THRESHOLD: u32 = 3;

/// Retry parameters for one kind of request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestKindConfig {
    /// Re-publications allowed after the first send.
    pub max_retry_count: u32,
    /// How long to wait for a response to each send.
    pub max_wait: Duration,
}

impl Default for RequestKindConfig {
    fn default() -> Self {
        Self {
            max_retry_count: DEFAULT_MAX_RETRY_COUNT,
            max_wait: DEFAULT_MAX_WAIT,
        }
    }
}

impl RequestKindConfig {
    pub fn new(max_retry_count: u32, max_wait: Duration) -> Self {
        Self {
            max_retry_count,
            max_wait,
        }
    }
}

/// Configuration for the dispatch engine.
#[derive(Debug, Clone)]
pub struct CommConfig {
    /// Interval between heartbeat tracker passes.
    ///
    /// PDPs are also told to send heartbeats at this interval.
    pub heartbeat_interval: Duration,

    /// Inbound status messages older than this are discarded unread.
    pub max_message_age: Duration,

    /// Consecutive silent passes before a PDP is probed.
    pub missed_heartbeat_threshold: u32,

    /// Whether the heartbeat tracker sends liveness probes.
    pub heartbeat_probe_enabled: bool,

    /// UPDATE retry parameters.
    pub update: RequestKindConfig,

    /// STATE-CHANGE retry parameters.
    pub state_change: RequestKindConfig,

    /// HEALTH-CHECK retry parameters.
    pub health_check: RequestKindConfig,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_message_age: DEFAULT_MAX_MESSAGE_AGE,
            missed_heartbeat_threshold: DEFAULT_MISSED_HEARTBEAT_THRESHOLD,
            heartbeat_probe_enabled: true,
            update: RequestKindConfig::default(),
            state_change: RequestKindConfig::default(),
            health_check: RequestKindConfig::default(),
        }
    }
}

impl CommConfig {
    /// Checks that every duration and threshold is usable.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(CommError::Config("heartbeat_interval must be > 0".into()));
        }
        if self.max_message_age.is_zero() {
            return Err(CommError::Config("max_message_age must be > 0".into()));
        }
        if self.missed_heartbeat_threshold == 0 {
            return Err(CommError::Config(
                "missed_heartbeat_threshold must be > 0".into(),
            ));
        }
        for (name, kind) in [
            ("update", &self.update),
            ("state_change", &self.state_change),
            ("health_check", &self.health_check),
        ] {
            if kind.max_wait.is_zero() {
                return Err(CommError::Config(format!("{name}.max_wait must be > 0")));
            }
        }
        Ok(())
    }
}
