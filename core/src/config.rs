//! Protocol configuration
//!
//! Tunables for the lifecycle manager, broadcaster and scanner. Platform code
//! usually constructs [`ProtocolConfig::default`] and overrides a field or two.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Longest session the backend will issue (8 hours)
pub const MAX_SESSION_TTL_SECS: u64 = 8 * 60 * 60;

/// Default session length (1 hour)
pub const DEFAULT_SESSION_TTL_SECS: u64 = 60 * 60;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// What to do when a broadcast starts while the same organization is
/// already advertising on this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastPolicy {
    /// Stop the running advertisement and start the new one atomically
    #[default]
    Replace,
    /// Fail the new start with `BroadcastActive`
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Timeout applied to each backend call
    pub backend_timeout_ms: u64,
    /// TTL used when the caller does not pick one
    pub default_session_ttl_secs: u64,
    /// Requested TTLs above this are clamped
    pub max_session_ttl_secs: u64,
    /// Interval between radio polls while scanning
    pub scan_poll_interval_ms: u64,
    /// Minimum gap before the same digest is reported again
    pub detection_dedupe_secs: u64,
    /// Buffered detections before the scanner starts dropping batches
    pub detection_channel_capacity: usize,
    pub broadcast_policy: BroadcastPolicy,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            backend_timeout_ms: 10_000,
            default_session_ttl_secs: DEFAULT_SESSION_TTL_SECS,
            max_session_ttl_secs: MAX_SESSION_TTL_SECS,
            scan_poll_interval_ms: 1_000,
            detection_dedupe_secs: 30,
            detection_channel_capacity: 64,
            broadcast_policy: BroadcastPolicy::Replace,
        }
    }
}

impl ProtocolConfig {
    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "backend_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.scan_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "scan_poll_interval_ms must be > 0".to_string(),
            ));
        }
        if self.detection_channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "detection_channel_capacity must be > 0".to_string(),
            ));
        }
        if self.max_session_ttl_secs == 0 || self.max_session_ttl_secs > MAX_SESSION_TTL_SECS {
            return Err(ConfigError::Invalid(format!(
                "max_session_ttl_secs must be in 1..={}",
                MAX_SESSION_TTL_SECS
            )));
        }
        if self.default_session_ttl_secs == 0
            || self.default_session_ttl_secs > self.max_session_ttl_secs
        {
            return Err(ConfigError::Invalid(
                "default_session_ttl_secs must be in 1..=max_session_ttl_secs".to_string(),
            ));
        }
        Ok(())
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    pub fn scan_poll_interval(&self) -> Duration {
        Duration::from_millis(self.scan_poll_interval_ms)
    }

    pub fn detection_dedupe_window(&self) -> Duration {
        Duration::from_secs(self.detection_dedupe_secs)
    }
}
