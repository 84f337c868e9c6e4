//! Gateway configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (default `config/gateway.toml`)
//! 2. environment variables prefixed with `TSE_`
//!
//! Nested keys in environment variables are separated by a double underscore,
//! so single underscores inside key names survive:
//!
//! ```text
//! TSE_APPLICATION__LOG_LEVEL=debug
//! TSE_SERVER__PORT=9000
//! ```
//!
//! # Example
//!
//! ```no_run
//! use tse_commander::config::GatewayConfig;
//!
//! let config = GatewayConfig::load_from("config/gateway.toml")?;
//! println!("Listening on {}:{}", config.server.bind, config.server.port);
//! println!("Devices: {}", config.devices.len());
//! # Ok::<(), tse_commander::config::ConfigError>(())
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/gateway.toml";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file or environment could not be read or deserialized.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// Values were read but are inconsistent or out of range.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Client-facing listener settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Device definitions, in registration order
    #[serde(default)]
    pub devices: Vec<DeviceDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Listener configuration for the text protocol front-end
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind
    #[serde(default = "default_bind")]
    pub bind: String,
    /// TCP port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Greeting line sent to every new connection
    #[serde(default = "default_banner")]
    pub banner: String,
    /// Longest accepted input line in bytes, excluding the line ending
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            banner: default_banner(),
            max_line_length: default_max_line_length(),
        }
    }
}

/// One configured instrument
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Unique device identifier used by `describe` and `connect`
    pub id: String,
    /// Free text shown by `list`
    #[serde(default)]
    pub description: String,
    /// Maximum time to wait for a response, in milliseconds
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,
    /// Marker ending a response; the transport frames responses when absent
    #[serde(default)]
    pub response_termination: Option<String>,
    /// Appended to every command written to the device
    #[serde(default)]
    pub request_termination: Option<String>,
    /// How the instrument is reached
    pub transport: TransportConfig,
}

impl DeviceDefinition {
    /// Response timeout as a [`Duration`].
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// Transport variants, tagged by `kind` in the configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    /// RS-232 / USB-serial instrument
    Serial {
        /// Serial device path (e.g., "/dev/ttyUSB0", "COM3")
        path: String,
        /// Baud rate
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        /// Data bits (5-8)
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        /// Parity setting
        #[serde(default)]
        parity: Parity,
    },
    /// Network-attached instrument reached over a TCP stream
    Tcp {
        /// Host name or address
        host: String,
        /// TCP port
        port: u16,
    },
    /// Simulated instrument that echoes every command back
    Loopback {
        /// Simulated response latency in milliseconds
        #[serde(default)]
        latency_ms: u64,
    },
}

/// Parity modes for serial communication
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
    /// Parity bit always set
    Mark,
    /// Parity bit always cleared
    Space,
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Parity::None => "NONE",
            Parity::Odd => "ODD",
            Parity::Even => "EVEN",
            Parity::Mark => "MARK",
            Parity::Space => "SPACE",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8023
}

fn default_banner() -> String {
    "Welcome! Run '?' for more info.".to_string()
}

fn default_max_line_length() -> usize {
    8192
}

fn default_response_timeout() -> u64 {
    3000
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl GatewayConfig {
    /// Load configuration from a specific file path
    ///
    /// Environment variables (`TSE_` prefix) take precedence over the file.
    /// The result is validated before it is returned.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("TSE_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string, without environment overrides
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::new().merge(Toml::string(toml)).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Port and line length limit are non-zero
    /// - Device IDs are non-empty, contain no whitespace and are unique
    /// - Each device has a positive timeout and sane transport parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.server.port == 0 {
            return Err(ConfigError::ValidationError(
                "server.port must be non-zero".to_string(),
            ));
        }

        if self.server.max_line_length == 0 {
            return Err(ConfigError::ValidationError(
                "server.max_line_length must be > 0".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for device in &self.devices {
            if device.id.is_empty() {
                return Err(ConfigError::ValidationError(
                    "Device id cannot be empty".to_string(),
                ));
            }
            if device.id.chars().any(char::is_whitespace) {
                return Err(ConfigError::ValidationError(format!(
                    "Device id '{}' must not contain whitespace",
                    device.id
                )));
            }
            if !ids.insert(device.id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate device ID: '{}'",
                    device.id
                )));
            }

            self.validate_device(device)?;
        }

        Ok(())
    }

    fn validate_device(&self, device: &DeviceDefinition) -> Result<(), ConfigError> {
        if device.response_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(format!(
                "Device '{}': 'response_timeout_ms' must be > 0",
                device.id
            )));
        }

        if matches!(device.response_termination.as_deref(), Some("")) {
            return Err(ConfigError::ValidationError(format!(
                "Device '{}': 'response_termination' cannot be empty",
                device.id
            )));
        }

        match &device.transport {
            TransportConfig::Serial {
                path, data_bits, ..
            } => {
                if path.is_empty() {
                    return Err(ConfigError::ValidationError(format!(
                        "Serial device '{}': 'path' cannot be empty",
                        device.id
                    )));
                }
                if !(5..=8).contains(data_bits) {
                    return Err(ConfigError::ValidationError(format!(
                        "Serial device '{}': 'data_bits' must be 5-8, got {}",
                        device.id, data_bits
                    )));
                }
            }
            TransportConfig::Tcp { host, port } => {
                if host.is_empty() {
                    return Err(ConfigError::ValidationError(format!(
                        "TCP device '{}': 'host' cannot be empty",
                        device.id
                    )));
                }
                if *port == 0 {
                    return Err(ConfigError::ValidationError(format!(
                        "TCP device '{}': 'port' must be non-zero",
                        device.id
                    )));
                }
            }
            TransportConfig::Loopback { .. } => {}
        }

        Ok(())
    }

    /// Get a device definition by id
    pub fn device(&self, id: &str) -> Option<&DeviceDefinition> {
        self.devices.iter().find(|d| d.id == id)
    }
}
