//! Configuration management
//!
//! Layered as: built-in defaults, then an optional TOML file, then
//! `SIPUA__SECTION__KEY` environment variables.

use crate::domain::{IdentityProfile, TransportProtocol, UaError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Prefix of environment overrides, e.g. `SIPUA__PROFILE__USERNAME`
pub const ENV_PREFIX: &str = "SIPUA";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub profile: ProfileConfig,
    pub agent: AgentConfig,
    pub logging: LoggingConfig,
}

/// Who we register as and where
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    pub username: String,
    pub password: String,
    pub local_port: u16,
    pub transport: TransportProtocol,
    pub registrar_ip: String,
    pub registrar_port: u16,
    pub registrar_transport: TransportProtocol,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub user_agent: String,
    /// Expiry requested by the initial REGISTER, in seconds
    pub register_expiry: u32,
    /// Sends that may wait for the outbound worker before callers block
    pub outbound_queue_capacity: usize,
    /// Client transaction timeout (64*T1)
    pub transaction_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub level: String,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            local_port: 5060,
            transport: TransportProtocol::Udp,
            registrar_ip: String::new(),
            registrar_port: 5060,
            registrar_transport: TransportProtocol::Udp,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("sipua/{}", env!("CARGO_PKG_VERSION")),
            register_expiry: 3600,
            outbound_queue_capacity: 64,
            transaction_timeout_ms: 32_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AgentConfig {
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }
}

impl ProfileConfig {
    pub fn to_profile(&self) -> IdentityProfile {
        IdentityProfile {
            username: self.username.clone(),
            password: self.password.clone(),
            local_ip: String::new(),
            local_port: self.local_port,
            transport: self.transport,
            remote_ip: self.registrar_ip.clone(),
            remote_port: self.registrar_port,
            remote_transport: self.registrar_transport,
        }
    }
}

impl From<&ProfileConfig> for IdentityProfile {
    fn from(config: &ProfileConfig) -> Self {
        config.to_profile()
    }
}

impl Config {
    /// Load defaults, then `path` if it exists, then the environment
    pub fn load(path: impl AsRef<Path>) -> Result<Self, UaError> {
        let defaults = config::Config::try_from(&Config::default()).map_err(config_error)?;

        let settings = config::Config::builder()
            .add_source(defaults)
            .add_source(
                config::File::from(path.as_ref())
                    .format(config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(config_error)?;

        let config: Config = settings.try_deserialize().map_err(config_error)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml_str(text: &str) -> Result<Self, UaError> {
        let config: Config =
            toml::from_str(text).map_err(|e| UaError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), UaError> {
        if self.agent.outbound_queue_capacity == 0 {
            return Err(UaError::Config(
                "agent.outbound_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.agent.transaction_timeout_ms < 64 {
            return Err(UaError::Config(
                "agent.transaction_timeout_ms must be at least 64".to_string(),
            ));
        }
        Ok(())
    }
}

fn config_error(err: config::ConfigError) -> UaError {
    UaError::Config(err.to_string())
}
