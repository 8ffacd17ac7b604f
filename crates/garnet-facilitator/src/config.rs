use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

const CONFIG_FILE_NAME: &str = "facilitator.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read or write the configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    TomlDeserialization(#[from] toml::de::Error),
    #[error("failed to serialize TOML: {0}")]
    TomlSerialization(#[from] toml::ser::Error),
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub network: NetworkConfig,
    pub service: ServiceConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NetworkConfig {
    /// Address the facilitator peer binds.
    pub address: String,
    /// Port of the punchthrough stride socket; 0 picks one.
    pub stride_port: u16,
    /// Ports of the four NAT detection sockets; 0 picks one each.
    pub detection_ports: [u16; 4],
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServiceConfig {
    pub name: String,
    pub max_clients: u32,
    /// Line shown to server browsers pinging the facilitator.
    pub advertisement: String,
    pub log_level: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:61111".to_string(),
            stride_port: 61112,
            detection_ports: [61113, 61114, 61115, 61116],
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "Garnet Facilitator".to_string(),
            max_clients: 512,
            advertisement: "garnet-facilitator".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            service: ServiceConfig::default(),
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
        if self.service.name.trim().is_empty() {
            return Err(ConfigError::Validation("service name cannot be empty".into()));
        }
        if self.service.max_clients == 0 {
            return Err(ConfigError::Validation(
                "max_clients must be greater than 0".into(),
            ));
        }
        if log::Level::from_str(&self.service.log_level).is_err() {
            return Err(ConfigError::Validation(format!(
                "unknown log level '{}'",
                self.service.log_level
            )));
        }
        Ok(())
    }

    pub fn listen_address(&self) -> SocketAddr {
        SocketAddr::from_str(&self.network.address).expect("validated")
    }

    pub fn log_level(&self) -> log::Level {
        log::Level::from_str(&self.service.log_level).unwrap_or(log::Level::Info)
    }
}

/// Loads the config next to the binary, writing the default on first run.
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn bad_address_is_rejected() {
        let mut config = Config::default();
        config.network.address = "not-an-address".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_round_trip() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.network.address, config.network.address);
        assert_eq!(parsed.network.detection_ports, config.network.detection_ports);
    }
}
