use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use rehearse_engine::EngineConfig;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long `play()` waits for an in-flight load before giving up.
    pub load_timeout_ms: u64,
    pub load_poll_interval_ms: u64,
    /// Time constant of volume/pan/gate ramps.
    pub ramp_time_ms: f32,
    /// Samples per RMS window.
    pub meter_window: usize,
    /// RMS to display-level multiplier; levels clamp at 100.
    pub meter_scale: f32,
    pub command_capacity: usize,
    /// Samples each metering ring holds between meter reads. Samples that
    /// arrive while a ring is full are dropped.
    pub tap_capacity: usize,
    /// Sample rate used when no output device is attached.
    pub offline_sample_rate: u32,
    /// Directory relative source references are resolved against.
    pub sample_root: Option<PathBuf>,
    /// Secondary byte cache, one file per track id.
    pub cache_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            load_timeout_ms: 5000,
            load_poll_interval_ms: 100,
            ramp_time_ms: 10.0,
            meter_window: 1024,
            meter_scale: 300.0,
            command_capacity: 256,
            tap_capacity: 16384,
            offline_sample_rate: 48000,
            sample_root: None,
            cache_dir: None,
        }
    }
}

impl SessionConfig {
    fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("rehearse").join("config.toml"))
    }

    /// Read the user config, falling back to defaults when it is missing or
    /// malformed.
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };

        match fs::read_to_string(&path) {
            Ok(contents) => Self::from_toml(&contents).unwrap_or_else(|e| {
                warn!(path = %path.display(), "ignoring malformed config: {e}");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    pub fn load_poll_interval(&self) -> Duration {
        Duration::from_millis(self.load_poll_interval_ms.max(1))
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            ramp_time: self.ramp_time_ms / 1000.0,
            command_capacity: self.command_capacity.max(16),
            tap_capacity: self.tap_capacity.max(self.meter_window.max(1) * 2),
            ..EngineConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config =
            SessionConfig::from_toml("load_timeout_ms = 2000\nmeter_scale = 250.0\n").unwrap();
        assert_eq!(config.load_timeout(), Duration::from_secs(2));
        assert_eq!(config.meter_scale, 250.0);
        assert_eq!(config.meter_window, 1024);
        assert!(config.cache_dir.is_none());
    }

    #[test]
    fn test_paths() {
        let config = SessionConfig::from_toml("cache_dir = \"/tmp/rehearse-cache\"").unwrap();
        assert_eq!(config.cache_dir, Some(PathBuf::from("/tmp/rehearse-cache")));
    }

    #[test]
    fn test_malformed_config_is_error() {
        assert!(SessionConfig::from_toml("load_timeout_ms = \"soon\"").is_err());
    }

    #[test]
    fn test_engine_config() {
        let config = SessionConfig {
            ramp_time_ms: 20.0,
            meter_window: 10000,
            tap_capacity: 100,
            ..Default::default()
        };
        let engine = config.engine_config();
        assert!((engine.ramp_time - 0.020).abs() < 1e-6);
        assert_eq!(engine.tap_capacity, 20000);
    }
}
