use error::ConfigError;
use garnet_transport::{CryptoMode, Options, TransType};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub mod error;

const CONFIG_FILE_NAME: &str = "garnet.toml";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub network: NetworkConfig,
    pub transport: TransportConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NetworkConfig {
    pub address: String,
    pub backlog: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TransportConfig {
    /// "live" or "file".
    pub mode: String,
    pub latency_ms: u64,
    pub passphrase: Option<String>,
    /// "none", "ctr" or "gcm".
    pub crypto: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:4200".to_string(),
            backlog: 16,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mode: "live".to_string(),
            latency_ms: 120,
            passphrase: None,
            crypto: "none".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if SocketAddr::from_str(&self.network.address).is_err() {
            return Err(ConfigError::Validation(format!(
                "invalid network address '{}', expected IP:PORT",
                self.network.address
            )));
        }
        if self.network.backlog == 0 {
            return Err(ConfigError::Validation(
                "backlog must be greater than 0".to_string(),
            ));
        }
        self.transport_options().map(|_| ())
    }

    /// Translates the file-level settings into transport options.
    pub fn transport_options(&self) -> Result<Options, ConfigError> {
        let mut opts = match self.transport.mode.as_str() {
            "live" => Options::live(),
            "file" => Options::file(),
            other => {
                return Err(ConfigError::Validation(format!(
                    "unknown transport mode '{}'",
                    other
                )));
            }
        };
        if opts.transtype == TransType::Live {
            opts.tsbpd_delay_us = self.transport.latency_ms * 1000;
        }
        opts.crypto_mode = match self.transport.crypto.as_str() {
            "none" => CryptoMode::None,
            "ctr" => CryptoMode::Ctr,
            "gcm" => CryptoMode::Gcm,
            other => {
                return Err(ConfigError::Validation(format!(
                    "unknown crypto mode '{}'",
                    other
                )));
            }
        };
        opts.passphrase = self.transport.passphrase.clone();
        opts.validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        Ok(opts)
    }
}

pub fn handle() -> Result<Config, ConfigError> {
    let config_path = PathBuf::from(CONFIG_FILE_NAME);
    if config_path.exists() {
        let config_content = fs::read_to_string(&config_path)?;
        let config: Config = toml::from_str(&config_content)?;
        config.validate()?;
        Ok(config)
    } else {
        let config = Config::default();
        save(&config, &config_path)?;
        Ok(config)
    }
}

fn save(config: &Config, path: &Path) -> Result<(), ConfigError> {
    let config_content = toml::to_string_pretty(config)?;
    let mut file = fs::File::create(path)?;
    file.write_all(config_content.as_bytes())?;
    Ok(())
}
