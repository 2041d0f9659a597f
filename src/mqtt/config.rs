//! Broker and session configuration
//!
//! Loaded from `<config dir>/cloudlink/config.toml`. A missing file degrades to
//! defaults instead of preventing startup.

use super::error::{ConfigError, TransportError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = "cloudlink";
const CONFIG_FILE: &str = "config.toml";
const DEFAULT_PORT: u16 = 1883;

/// Broker connection parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttServer {
    /// Broker address, `host:port` with an optional `tcp://` or `mqtt://` prefix
    pub url: String,
    /// Username, credentials are only sent when this is non-empty
    pub user: String,
    pub pw: String,
}

impl Default for MqttServer {
    fn default() -> Self {
        Self {
            url: "127.0.0.1:1883".to_string(),
            user: String::new(),
            pw: String::new(),
        }
    }
}

impl fmt::Display for MqttServer {
    /// Password is left out
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.user.is_empty() {
            write!(f, "{}", self.url)
        } else {
            write!(f, "{}@{}", self.user, self.url)
        }
    }
}

impl MqttServer {
    /// Splits the url into host and port, defaulting the port to 1883
    ///
    /// IPv6 hosts have to be bracketed, `[::1]:1883`. The brackets are not part
    /// of the returned host.
    pub fn host_and_port(&self) -> Result<(String, u16), TransportError> {
        let invalid = || TransportError::InvalidAddress(self.url.clone());
        let address = self
            .url
            .trim()
            .trim_start_matches("tcp://")
            .trim_start_matches("mqtt://");

        let (host, port) = match address.strip_prefix('[') {
            Some(bracketed) => {
                let (host, rest) = bracketed.split_once(']').ok_or_else(invalid)?;
                let port = match rest {
                    "" => None,
                    rest => Some(rest.strip_prefix(':').ok_or_else(invalid)?),
                };
                (host, port)
            }
            None => match address.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (address, None),
            },
        };

        let host = host.trim();
        if host.is_empty() {
            return Err(invalid());
        }
        let port = match port {
            Some(port) => port.trim().parse::<u16>().map_err(|_| invalid())?,
            None => DEFAULT_PORT,
        };

        Ok((host.to_string(), port))
    }
}

/// Configuration for one session manager instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub server: MqttServer,
    /// Fixed for the lifetime of the process
    pub client_id: String,
    pub keep_alive_secs: u64,
    /// Topic the command line collaborator publishes `get_info` requests to
    pub command_topic: String,
    /// Capacity of the rumqttc request queue and of the inbound event channel
    pub request_capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            server: MqttServer::default(),
            client_id: "cloudlink".to_string(),
            keep_alive_secs: 5,
            command_topic: super::registry::COMMAND_TOPIC.to_string(),
            request_capacity: 100,
        }
    }
}

impl MqttConfig {
    /// Location of the config file in the platform config directory
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let mut path = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        Ok(path)
    }

    /// Reads the config from `path`, or from [`default_path`](Self::default_path)
    ///
    /// A missing file yields the defaults. A file that exists but does not parse
    /// is an error.
    pub async fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::default_path()?,
        };

        if !tokio::fs::try_exists(&path).await? {
            warn!(
                "Config file {} does not exist, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(&path).await?;
        let config: Self = toml::from_str(&content)?;
        info!("Loaded config from {}", path.display());
        debug!("Config: {:?}", config);
        Ok(config)
    }

    /// Writes a default config file if none exists yet
    pub async fn ensure_default_config(path: &Path) -> Result<(), ConfigError> {
        if tokio::fs::try_exists(path).await? {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = toml::to_string_pretty(&Self::default())?;
        tokio::fs::write(path, content).await?;
        info!("Wrote default config to {}", path.display());
        Ok(())
    }

    pub fn endpoint(&self) -> String {
        self.server.url.clone()
    }
}
