use log::{warn, LevelFilter};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configurable log level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    #[must_use]
    pub const fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Off => LevelFilter::Off,
            Self::Error => LevelFilter::Error,
            Self::Warn => LevelFilter::Warn,
            Self::Info => LevelFilter::Info,
            Self::Debug => LevelFilter::Debug,
        }
    }
}

/// Upper bound for a single channel transaction
pub const MAX_TRANSACTION_TIMEOUT_MS: u64 = 4500;

/// Extra time a command caller waits beyond two transactions
pub const COMMAND_WAIT_MARGIN: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-transaction timeout
    #[serde(default = "default_transaction_timeout_ms")]
    pub transaction_timeout_ms: u64,
    /// Idle wait between acquisition cycles (0 = just yield)
    #[serde(default = "default_cycle_pause_ms")]
    pub cycle_pause_ms: u64,
    /// Consecutive transport failures before the channel is reported degraded
    #[serde(default = "default_degraded_after_failures")]
    pub degraded_after_failures: u32,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

const fn default_transaction_timeout_ms() -> u64 {
    1000
}

const fn default_cycle_pause_ms() -> u64 {
    250
}

const fn default_degraded_after_failures() -> u32 {
    3
}

const fn default_backoff_initial_ms() -> u64 {
    500
}

const fn default_backoff_max_ms() -> u64 {
    10_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transaction_timeout_ms: default_transaction_timeout_ms(),
            cycle_pause_ms: default_cycle_pause_ms(),
            degraded_after_failures: default_degraded_after_failures(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl EngineConfig {
    /// Clamp values to valid ranges
    pub fn validate(&mut self) {
        if self.transaction_timeout_ms > MAX_TRANSACTION_TIMEOUT_MS {
            warn!(
                "Clamping transaction_timeout_ms from {} to {}",
                self.transaction_timeout_ms, MAX_TRANSACTION_TIMEOUT_MS
            );
            self.transaction_timeout_ms = MAX_TRANSACTION_TIMEOUT_MS;
        }
        if self.transaction_timeout_ms == 0 {
            warn!("transaction_timeout_ms is 0, resetting to default");
            self.transaction_timeout_ms = default_transaction_timeout_ms();
        }
        if self.degraded_after_failures == 0 {
            warn!("degraded_after_failures is 0, using 1");
            self.degraded_after_failures = 1;
        }
        if self.backoff_max_ms < self.backoff_initial_ms {
            warn!(
                "Raising backoff_max_ms from {} to backoff_initial_ms ({})",
                self.backoff_max_ms, self.backoff_initial_ms
            );
            self.backoff_max_ms = self.backoff_initial_ms;
        }
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    pub fn cycle_pause(&self) -> Duration {
        Duration::from_millis(self.cycle_pause_ms)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    /// How long an on-demand caller waits: the in-flight transaction plus its own
    pub fn command_wait(&self) -> Duration {
        self.transaction_timeout() * 2 + COMMAND_WAIT_MARGIN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_json() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.cycle_pause(), Duration::from_millis(250));
        assert_eq!(config.command_wait(), Duration::from_millis(2500));
    }

    #[test]
    fn test_validate_clamps() {
        let mut config = EngineConfig {
            transaction_timeout_ms: 60_000,
            degraded_after_failures: 0,
            backoff_initial_ms: 2000,
            backoff_max_ms: 100,
            ..EngineConfig::default()
        };
        config.validate();
        assert_eq!(config.transaction_timeout_ms, MAX_TRANSACTION_TIMEOUT_MS);
        assert_eq!(config.degraded_after_failures, 1);
        assert_eq!(config.backoff_max_ms, 2000);
    }

    #[test]
    fn test_log_level() {
        let level: LogLevel = serde_json::from_str("\"debug\"").unwrap();
        assert_eq!(level.as_level_filter(), LevelFilter::Debug);
        assert_eq!(LogLevel::default(), LogLevel::Info);
    }
}
