//! Device configuration
//!
//! Defaults applied to every device a [`DeviceRegistry`](crate::audio::DeviceRegistry)
//! constructs. Stored as JSON.
//!
//! # Example
//!
//! ```no_run
//! use stdaudio::config::{AudioConfig, ConfigManager};
//!
//! let mut config = ConfigManager::load_or_default("stdaudio.json").unwrap();
//! config.buffer_size_frames = 256;
//! ConfigManager::save("stdaudio.json", &config).unwrap();
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lowest accepted sample rate override
pub const MIN_SAMPLE_RATE: u32 = 8_000;

/// Highest accepted sample rate override
pub const MAX_SAMPLE_RATE: u32 = 768_000;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Value out of range
    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Audio device defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Requested frames per hardware buffer (0 = hardware default)
    pub buffer_size_frames: u32,
    /// Sample rate override (None = mix format rate)
    pub sample_rate: Option<u32>,
    /// Ask for elevated priority on the processing thread
    pub realtime_priority: bool,
    /// Longest single wait on the hardware signal (milliseconds)
    pub wait_timeout_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            buffer_size_frames: 0,
            sample_rate: None,
            realtime_priority: true,
            wait_timeout_ms: 500,
        }
    }
}

impl AudioConfig {
    /// Wait timeout as a `Duration`
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    /// Check value ranges
    pub fn validate(&self) -> ConfigResult<()> {
        if self.wait_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "wait_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if let Some(rate) = self.sample_rate {
            if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&rate) {
                return Err(ConfigError::Invalid(format!(
                    "sample_rate {rate} outside {MIN_SAMPLE_RATE}..={MAX_SAMPLE_RATE}"
                )));
            }
        }
        Ok(())
    }
}

/// Loads and saves [`AudioConfig`] files
pub struct ConfigManager;

impl ConfigManager {
    /// Load and validate a config file
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<AudioConfig> {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), "Loading config");

        let content = std::fs::read_to_string(path)?;
        let config: AudioConfig = serde_json::from_str(&content)?;
        config.validate()?;

        tracing::info!(path = %path.display(), "Config loaded successfully");
        Ok(config)
    }

    /// Load a config file, falling back to defaults if it does not exist
    pub fn load_or_default(path: impl AsRef<Path>) -> ConfigResult<AudioConfig> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            Ok(AudioConfig::default())
        }
    }

    /// Validate and write a config file, creating parent directories
    pub fn save(path: impl AsRef<Path>, config: &AudioConfig) -> ConfigResult<()> {
        let path = path.as_ref();
        config.validate()?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = serde_json::to_string_pretty(config)?;
        std::fs::write(path, content)?;

        tracing::info!(path = %path.display(), "Config saved successfully");
        Ok(())
    }

    /// Overwrite a config file with defaults
    pub fn reset(path: impl AsRef<Path>) -> ConfigResult<AudioConfig> {
        let config = AudioConfig::default();
        Self::save(path, &config)?;
        tracing::info!("Config reset to defaults");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_config_default() {
        let config = AudioConfig::default();

        assert_eq!(config.buffer_size_frames, 0);
        assert!(config.sample_rate.is_none());
        assert!(config.realtime_priority);
        assert_eq!(config.wait_timeout(), Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: AudioConfig = serde_json::from_str(r#"{"buffer_size_frames": 256}"#).unwrap();

        assert_eq!(config.buffer_size_frames, 256);
        assert!(config.realtime_priority);
        assert_eq!(config.wait_timeout_ms, 500);
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let config = AudioConfig {
            wait_timeout_ms: 0,
            ..AudioConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = AudioConfig {
            sample_rate: Some(4_000),
            ..AudioConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = AudioConfig {
            sample_rate: Some(96_000),
            ..AudioConfig::default()
        };
        assert!(config.validate().is_ok());
    }
}
