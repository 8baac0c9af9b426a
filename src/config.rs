//! Configuration loading using Figment.
//!
//! Settings are layered, lowest precedence first:
//! 1. Built-in defaults (`Settings::default()`)
//! 2. An optional TOML file (`katara.toml` unless another path is given)
//! 3. Environment variables prefixed with `KATARA_`, nested with `__`
//!
//! ```text
//! KATARA_DEVICE__PORT=/dev/ttyACM0
//! KATARA_ENGINE__POLL_INTERVAL_MS=5
//! KATARA_LOGGING__LEVEL=debug
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default settings file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "katara.toml";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The layered providers could not be merged or extracted.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    /// Values were loaded but are inconsistent.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Serial link to the valve controller.
    #[serde(default)]
    pub device: DeviceSettings,
    /// Execution engine tuning.
    #[serde(default)]
    pub engine: EngineSettings,
    /// Log output.
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Serial device settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Port identifier, e.g. "/dev/ttyACM0" or "COM3".
    #[serde(default)]
    pub port: Option<String>,
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Timeout for reading a single response line.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
    /// How long to wait for the identity line after sending the handshake.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
    /// The firmware resets when the port opens; wait this long before talking to it.
    #[serde(default = "default_reset_delay")]
    pub reset_delay_ms: u64,
    /// Identity line the firmware answers the handshake with.
    #[serde(default = "default_firmware_signature")]
    pub firmware_signature: String,
    /// Lowest addressable pin.
    #[serde(default = "default_min_pin")]
    pub min_pin: u8,
    /// Highest addressable pin.
    #[serde(default = "default_max_pin")]
    pub max_pin: u8,
}

/// Engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Granularity of pause ticks and cancellation checks.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_read_timeout() -> u64 {
    100
}

fn default_handshake_timeout() -> u64 {
    1000
}

fn default_reset_delay() -> u64 {
    1000
}

fn default_firmware_signature() -> String {
    "1KATARA Arduino Firmware".to_string()
}

fn default_min_pin() -> u8 {
    2
}

fn default_max_pin() -> u8 {
    69
}

fn default_poll_interval() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: default_baud_rate(),
            read_timeout_ms: default_read_timeout(),
            handshake_timeout_ms: default_handshake_timeout(),
            reset_delay_ms: default_reset_delay(),
            firmware_signature: default_firmware_signature(),
            min_pin: default_min_pin(),
            max_pin: default_max_pin(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl DeviceSettings {
    /// Single line read timeout.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Handshake response timeout.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Delay between opening the port and the handshake.
    pub fn reset_delay(&self) -> Duration {
        Duration::from_millis(self.reset_delay_ms)
    }
}

impl EngineSettings {
    /// Pause tick and cancellation poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Settings {
    /// Load from `katara.toml` (if present) and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load from a specific file path. A missing file falls back to defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Settings::default()))
                .merge(Toml::file(path.as_ref()))
                .merge(Env::prefixed("KATARA_").split("__")),
        )
    }

    /// Extract and validate from an already assembled figment.
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let settings: Self = figment.extract().map_err(Box::new)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings after loading.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        if self.device.min_pin > self.device.max_pin {
            return Err(ConfigError::ValidationError(format!(
                "min_pin {} is greater than max_pin {}",
                self.device.min_pin, self.device.max_pin
            )));
        }

        // Pins travel as two decimal digits on the wire.
        if self.device.max_pin > 99 {
            return Err(ConfigError::ValidationError(format!(
                "max_pin {} does not fit the two-digit pin field",
                self.device.max_pin
            )));
        }

        if self.engine.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }

        if self.device.read_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "read_timeout_ms must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}
