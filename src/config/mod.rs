//! Configuration module
//!
//! Handles loading and saving FrameNet configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::network;
use crate::protocol::{OversizePolicy, DEFAULT_ID_BASE, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_PORT};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Network settings
    #[serde(default)]
    pub network: NetworkConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Name shown in log output
    #[serde(default = "default_name")]
    pub name: String,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
    /// Log file path (optional)
    pub log_file: Option<PathBuf>,
}

fn default_name() -> String {
    "framenet".to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            verbose: false,
            log_file: None,
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Port to listen on or connect to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Interface to bind to (default: all)
    pub bind_address: Option<String>,
    /// First connection id a server hands out
    #[serde(default = "default_id_base")]
    pub id_base: u64,
    /// Connection timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Handshake timeout in ms (unset: wait indefinitely)
    pub handshake_timeout_ms: Option<u64>,
    /// Largest message body accepted without applying `oversize_policy`
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// `reject` disconnects the sender, `warn` logs and accepts
    #[serde(default)]
    pub oversize_policy: OversizePolicy,
    /// Simultaneous connections allowed from one address (demo server)
    #[serde(default = "default_max_connections_per_ip")]
    pub max_connections_per_ip: u32,
    /// Messages held for a peer that has not finished the handshake
    #[serde(default = "default_max_pending_unvalidated")]
    pub max_pending_unvalidated: usize,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_id_base() -> u64 {
    DEFAULT_ID_BASE
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_max_connections_per_ip() -> u32 {
    4
}

fn default_max_pending_unvalidated() -> usize {
    network::DEFAULT_MAX_PENDING_UNVALIDATED
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: None,
            id_base: default_id_base(),
            connect_timeout_ms: default_connect_timeout(),
            handshake_timeout_ms: None,
            max_message_size: default_max_message_size(),
            oversize_policy: OversizePolicy::default(),
            max_connections_per_ip: default_max_connections_per_ip(),
            max_pending_unvalidated: default_max_pending_unvalidated(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("framenet/config.toml")),
            Some(PathBuf::from("./framenet.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Reject values the network layer cannot work with
    pub fn validate(&self) -> ConfigResult<()> {
        let network = &self.network;
        if network.max_message_size == 0 {
            return Err(ConfigError::Invalid(
                "network.max_message_size must be greater than zero".to_string(),
            ));
        }
        if network.max_message_size > u32::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "network.max_message_size must fit in 32 bits, got {}",
                network.max_message_size
            )));
        }
        if network.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "network.connect_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if network.handshake_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "network.handshake_timeout_ms must be greater than zero when set".to_string(),
            ));
        }
        if network.max_pending_unvalidated == 0 {
            return Err(ConfigError::Invalid(
                "network.max_pending_unvalidated must be greater than zero".to_string(),
            ));
        }
        if network.max_connections_per_ip == 0 {
            return Err(ConfigError::Invalid(
                "network.max_connections_per_ip must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Runtime network settings derived from this file
    pub fn network_config(&self) -> network::NetworkConfig {
        let file = &self.network;
        let defaults = network::NetworkConfig::default();
        network::NetworkConfig {
            port: file.port,
            bind_address: file.bind_address.clone().unwrap_or(defaults.bind_address),
            id_base: file.id_base,
            connect_timeout_ms: file.connect_timeout_ms,
            handshake_timeout_ms: file.handshake_timeout_ms,
            max_message_size: file.max_message_size,
            oversize_policy: file.oversize_policy,
            max_pending_unvalidated: file.max_pending_unvalidated,
        }
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            name: "lobby".to_string(),
            verbose: false,
            log_file: None,
        },
        network: NetworkConfig {
            bind_address: Some("0.0.0.0".to_string()),
            handshake_timeout_ms: Some(10_000),
            ..Default::default()
        },
    };

    Ok(toml::to_string_pretty(&config)?)
}
