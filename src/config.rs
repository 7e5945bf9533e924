//! Configuration system using Figment
//!
//! Configuration is loaded from, in increasing order of precedence:
//! 1. Built-in defaults
//! 2. An optional TOML file (e.g. `labflow.toml`)
//! 3. Environment variables prefixed with `LABFLOW_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated with a double underscore:
//!
//! ```text
//! LABFLOW_LOGGING__LEVEL=debug
//! LABFLOW_HOST__NAME="Bench 2"
//! LABFLOW_ENGINE__SETTLE_TIMEOUT_MS=10000
//! ```
//!
//! # Example
//!
//! ```no_run
//! use labflow::config::Settings;
//!
//! let settings = Settings::load(None)?;
//! println!("Log level: {}", settings.logging.level);
//! println!("Devices: {}", settings.devices.len());
//! # Ok::<(), labflow::config::ConfigError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::devices::value::NodeValue;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration could not be read or deserialized.
    #[error("Configuration load error: {0}")]
    Load(#[from] Box<figment::Error>),
    /// The configuration was read but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Host identity
    #[serde(default)]
    pub host: HostConfig,
    /// Execution engine tuning
    #[serde(default)]
    pub engine: EngineConfig,
    /// Logging output
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Units by namespace
    #[serde(default)]
    pub units: BTreeMap<String, UnitConfig>,
    /// Simulated devices exposed by the host
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// Host identity settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    /// Stable host identifier; generated when missing
    #[serde(default)]
    pub id: Option<String>,
    /// Human-readable host name; defaults to the machine hostname
    #[serde(default)]
    pub name: Option<String>,
}

/// Execution engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Lower bound applied to every polled node interval, in milliseconds
    #[serde(default)]
    pub min_poll_interval_ms: u64,
    /// Maximum time a state transfer waits for a node to settle, in milliseconds
    #[serde(default = "default_settle_timeout")]
    pub settle_timeout_ms: u64,
    /// Operation budget for a single expression evaluation
    #[serde(default = "default_max_operations")]
    pub max_expression_operations: u64,
}

impl EngineConfig {
    /// Settle timeout as a [`Duration`].
    pub fn settle_timeout(&self) -> Duration {
        Duration::from_millis(self.settle_timeout_ms)
    }

    /// Minimum poll interval as a [`Duration`].
    pub fn min_poll_interval(&self) -> Duration {
        Duration::from_millis(self.min_poll_interval_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_poll_interval_ms: 0,
            settle_timeout_ms: default_settle_timeout(),
            max_expression_operations: default_max_operations(),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Per-unit settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitConfig {
    /// Whether the unit is loaded
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Unit-specific options
    #[serde(default)]
    pub options: BTreeMap<String, toml::Value>,
}

/// A simulated device definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device identifier, unique among devices
    pub id: String,
    /// Human-readable label
    #[serde(default)]
    pub label: Option<String>,
    /// Model name reported in snapshots
    #[serde(default = "default_model")]
    pub model: String,
    /// Value nodes exposed by the device
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

/// Kind of a simulated value node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKindConfig {
    /// Value pushed by the device
    Readable,
    /// Bidirectional value with a target
    Writable,
    /// Value refreshed at an interval
    Polled,
}

/// A simulated node definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identifier, unique within its device
    pub id: String,
    /// Human-readable label
    #[serde(default)]
    pub label: Option<String>,
    /// Node kind
    pub kind: NodeKindConfig,
    /// Initial device value
    #[serde(default)]
    pub initial: Option<NodeValue>,
    /// Minimum poll interval for polled nodes, in milliseconds
    #[serde(default)]
    pub min_interval_ms: Option<u64>,
}

fn default_settle_timeout() -> u64 {
    5000
}

fn default_max_operations() -> u64 {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_model() -> String {
    "simulated".to_string()
}

impl Settings {
    /// Load settings from defaults, an optional TOML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));

        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }

        let settings: Settings = figment
            .merge(Env::prefixed("LABFLOW_").split("__"))
            .extract()
            .map_err(Box::new)?;

        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a TOML string, without environment overrides.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::string(source))
            .extract()
            .map_err(Box::new)?;

        settings.validate()?;
        Ok(settings)
    }

    /// Check semantic constraints that deserialization cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

        if !LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::Validation(format!(
                "Invalid log level '{}', expected one of {:?}",
                self.logging.level, LEVELS
            )));
        }

        if self.engine.max_expression_operations == 0 {
            return Err(ConfigError::Validation(
                "engine.max_expression_operations must be positive".to_string(),
            ));
        }

        let mut device_ids = HashSet::new();

        for device in &self.devices {
            if !device_ids.insert(device.id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate device id '{}'",
                    device.id
                )));
            }

            let mut node_ids = HashSet::new();

            for node in &device.nodes {
                if !node_ids.insert(node.id.as_str()) {
                    return Err(ConfigError::Validation(format!(
                        "Duplicate node id '{}' in device '{}'",
                        node.id, device.id
                    )));
                }

                if node.min_interval_ms.is_some() && node.kind != NodeKindConfig::Polled {
                    return Err(ConfigError::Validation(format!(
                        "Node '{}.{}' sets min_interval_ms but is not polled",
                        device.id, node.id
                    )));
                }
            }
        }

        Ok(())
    }

    /// Whether the unit registered under `namespace` is enabled.
    pub fn unit_enabled(&self, namespace: &str) -> bool {
        self.units.get(namespace).map_or(true, |unit| unit.enabled)
    }
}
