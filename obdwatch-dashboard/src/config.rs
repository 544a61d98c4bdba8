use anyhow::{Context, Result};
use log::warn;
use obdwatch_engine::{EngineConfig, LogLevel};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Adapter connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DongleConfig {
    /// `host:port` of the ELM327 adapter
    #[serde(default = "default_dongle_address")]
    pub address: String,
    /// Connect and socket I/O timeout
    #[serde(default = "default_dongle_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_dongle_address() -> String {
    "192.168.0.10:35000".to_string()
}

const fn default_dongle_timeout_ms() -> u64 {
    1000
}

impl Default for DongleConfig {
    fn default() -> Self {
        Self {
            address: default_dongle_address(),
            timeout_ms: default_dongle_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub dongle: DongleConfig,
    #[serde(default)]
    pub log_level: LogLevel,
    /// How often the watch display refreshes
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub engine: EngineConfig,
}

const fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dongle: DongleConfig::default(),
            log_level: LogLevel::default(),
            poll_interval_ms: default_poll_interval_ms(),
            engine: EngineConfig::default(),
        }
    }
}

impl Config {
    /// Clamp values to valid ranges and fix invalid values
    pub fn validate(&mut self) {
        self.engine.validate();
        if self.dongle.address.is_empty() {
            warn!("Dongle address is empty, resetting to default");
            self.dongle.address = default_dongle_address();
        }
        if self.dongle.timeout_ms > self.engine.transaction_timeout_ms {
            warn!(
                "Clamping dongle.timeout_ms from {} to {}",
                self.dongle.timeout_ms, self.engine.transaction_timeout_ms
            );
            self.dongle.timeout_ms = self.engine.transaction_timeout_ms;
        }
        if self.poll_interval_ms == 0 {
            warn!("poll_interval_ms is 0, resetting to default");
            self.poll_interval_ms = default_poll_interval_ms();
        }
    }

    /// Read a JSON config file. Runs before the logger is installed, so
    /// failures are returned rather than logged.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_slice(&json).context("Invalid config JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"dongle": {"address": "127.0.0.1:35000"}, "log_level": "debug"}"#)
                .unwrap();
        assert_eq!(config.dongle.address, "127.0.0.1:35000");
        assert_eq!(config.dongle.timeout_ms, 1000);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.engine, EngineConfig::default());
    }

    #[test]
    fn test_validate() {
        let mut config = Config {
            poll_interval_ms: 0,
            dongle: DongleConfig {
                address: String::new(),
                timeout_ms: 9000,
            },
            ..Config::default()
        };
        config.validate();
        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.dongle.address, "192.168.0.10:35000");
        assert_eq!(config.dongle.timeout_ms, config.engine.transaction_timeout_ms);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = Config::load(Path::new("/nonexistent/obdwatch.json")).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to read"));
    }
}
