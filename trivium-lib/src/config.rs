use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::constants::BATTERY_CHECK_INTERVAL_MIN;
use crate::error::Result;

/// Timing knobs of the session engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Period of the per-slot session timer.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Pause after every byte of a start frame.
    #[serde(default = "default_byte_delay_ms")]
    pub byte_delay_ms: u64,
    /// Size of a single telemetry read.
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// Battery is requested whenever the elapsed minutes are a multiple of this.
    #[serde(default = "default_battery_check_interval_min")]
    pub battery_check_interval_min: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            byte_delay_ms: default_byte_delay_ms(),
            read_buffer_size: default_read_buffer_size(),
            battery_check_interval_min: default_battery_check_interval_min(),
        }
    }
}

fn default_tick_interval_ms() -> u64 {
    20_000
}
fn default_byte_delay_ms() -> u64 {
    2
}
fn default_read_buffer_size() -> usize {
    28
}
fn default_battery_check_interval_min() -> u32 {
    BATTERY_CHECK_INTERVAL_MIN
}

impl EngineConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn byte_delay(&self) -> Duration {
        Duration::from_millis(self.byte_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{ "byte_delay_ms": 5 }"#).unwrap();
        assert_eq!(config.byte_delay(), Duration::from_millis(5));
        assert_eq!(config.tick_interval(), Duration::from_secs(20));
        assert_eq!(config.read_buffer_size, 28);
        assert_eq!(config.battery_check_interval_min, 5);
    }
}
