// Configuration management for the attendbeacon CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/attendbeacon/config.json
// - Linux: ~/.config/attendbeacon/config.json
// - Windows: %APPDATA%\attendbeacon\config.json

use anyhow::{Context, Result};
use attendbeacon_core::{BroadcastPolicy, Organization, ProtocolConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Organization used when a command omits `--org`
    pub default_org: String,

    /// Protocol tuning handed to the core library
    pub protocol: ProtocolConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_org: Organization::Nhs.slug().to_string(),
            protocol: ProtocolConfig::default(),
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("attendbeacon");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            config
                .protocol
                .validate()
                .context("Invalid protocol settings in config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value. The change is validated before it is kept.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut updated = self.clone();
        match key {
            "default_org" => {
                let org = Organization::from_slug(value);
                if !org.is_known() {
                    anyhow::bail!("Unknown organization: {}", value);
                }
                updated.default_org = org.slug().to_string();
            }
            "backend_timeout_ms" => {
                updated.protocol.backend_timeout_ms = value.parse().context("Invalid number")?;
            }
            "default_session_ttl_secs" => {
                updated.protocol.default_session_ttl_secs =
                    value.parse().context("Invalid number")?;
            }
            "max_session_ttl_secs" => {
                updated.protocol.max_session_ttl_secs = value.parse().context("Invalid number")?;
            }
            "scan_poll_interval_ms" => {
                updated.protocol.scan_poll_interval_ms = value.parse().context("Invalid number")?;
            }
            "detection_dedupe_secs" => {
                updated.protocol.detection_dedupe_secs = value.parse().context("Invalid number")?;
            }
            "detection_channel_capacity" => {
                updated.protocol.detection_channel_capacity =
                    value.parse().context("Invalid number")?;
            }
            "broadcast_policy" => {
                updated.protocol.broadcast_policy = match value {
                    "replace" => BroadcastPolicy::Replace,
                    "reject" => BroadcastPolicy::Reject,
                    _ => anyhow::bail!("broadcast_policy must be 'replace' or 'reject'"),
                };
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        updated.protocol.validate()?;
        *self = updated;
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        let p = &self.protocol;
        let policy = match p.broadcast_policy {
            BroadcastPolicy::Replace => "replace",
            BroadcastPolicy::Reject => "reject",
        };
        vec![
            ("default_org".to_string(), self.default_org.clone()),
            ("backend_timeout_ms".to_string(), p.backend_timeout_ms.to_string()),
            ("default_session_ttl_secs".to_string(), p.default_session_ttl_secs.to_string()),
            ("max_session_ttl_secs".to_string(), p.max_session_ttl_secs.to_string()),
            ("scan_poll_interval_ms".to_string(), p.scan_poll_interval_ms.to_string()),
            ("detection_dedupe_secs".to_string(), p.detection_dedupe_secs.to_string()),
            ("detection_channel_capacity".to_string(), p.detection_channel_capacity.to_string()),
            ("broadcast_policy".to_string(), policy.to_string()),
        ]
    }

    pub fn organization(&self) -> Organization {
        Organization::from_slug(&self.default_org)
    }
}
