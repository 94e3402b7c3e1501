//! Capture configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for one capture session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Device node path.
    pub device: PathBuf,
    /// Requested frame width in pixels.
    pub width: u32,
    /// Requested frame height in pixels.
    pub height: u32,
    /// Upper bound on a single readiness wait in the frame pump. Bounds how
    /// long `stop()` waits for the pump to notice the stop flag.
    pub poll_interval_ms: u64,
    /// How long `start()` waits for the first frame.
    pub ready_timeout_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/video0"),
            width: 640,
            height: 480,
            poll_interval_ms: 200,
            ready_timeout_ms: 10_000,
        }
    }
}

impl CaptureConfig {
    /// Creates a configuration for `device` at the given resolution.
    pub fn new<P: Into<PathBuf>>(device: P, width: u32, height: u32) -> Self {
        Self {
            device: device.into(),
            width,
            height,
            ..Self::default()
        }
    }

    /// Readiness wait bound for the frame pump.
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Startup wait bound for the first frame.
    pub const fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    /// Validates the configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.as_os_str().is_empty() {
            return Err(ConfigError::MissingDevice);
        }
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::InvalidDimensions {
                width: self.width,
                height: self.height,
            });
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidPollInterval);
        }
        if self.ready_timeout_ms == 0 {
            return Err(ConfigError::InvalidReadyTimeout);
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Empty device path.
    #[error("device path is empty")]
    MissingDevice,
    /// Zero width or height.
    #[error("invalid frame dimensions {width}x{height}")]
    InvalidDimensions {
        /// Requested width.
        width: u32,
        /// Requested height.
        height: u32,
    },
    /// Zero poll interval.
    #[error("poll interval must be at least 1 ms")]
    InvalidPollInterval,
    /// Zero startup timeout.
    #[error("ready timeout must be at least 1 ms")]
    InvalidReadyTimeout,
    /// The config file could not be read.
    #[error("failed to read config file: {0}")]
    FileReadError(String),
    /// The config file is not valid TOML for this schema.
    #[error("failed to parse config file: {0}")]
    ParseError(String),
}

/// Full configuration file format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FileConfig {
    /// The `[capture]` table.
    #[serde(default)]
    pub capture: CaptureConfig,
}

impl FileConfig {
    /// Loads configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::FileReadError(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Parses configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.capture.validate()?;
        Ok(config)
    }
}
