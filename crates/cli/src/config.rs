//! Configuration management for execwatch
//!
//! Handles loading and saving configuration from ~/.execwatch/config.toml

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use watch_client::{DEFAULT_SERVER_URL, WatchConfig};

/// Configuration for execwatch
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub watch: WatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_server_url")]
    pub url: String,

    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_server_url() -> String {
    DEFAULT_SERVER_URL.to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: default_server_url(),
            api_key: None,
        }
    }
}

impl Config {
    /// Get the path to the config file
    pub fn config_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".execwatch")
            .join("config.toml")
    }

    /// Load configuration from file, or return defaults if not found
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Get a configuration value by key path (e.g., "server.url")
    pub fn get(&self, key: &str) -> Option<String> {
        let parts: Vec<&str> = key.split('.').collect();
        let watch = &self.watch;

        match parts.as_slice() {
            ["server", "url"] => Some(self.server.url.clone()),
            ["server", "api_key"] => self.server.api_key.clone(),
            ["watch", "transport"] => Some(watch.transport.to_string()),
            ["watch", "polling"] => Some(watch.polling.to_string()),
            ["watch", "poll_interval_secs"] => Some(watch.poll_interval_secs.to_string()),
            ["watch", "keepalive_secs"] => Some(watch.keepalive_secs.to_string()),
            ["watch", "connect_timeout_secs"] => Some(watch.connect_timeout_secs.to_string()),
            ["watch", "reconnect", "base_delay_ms"] => {
                Some(watch.reconnect.base_delay_ms.to_string())
            }
            ["watch", "reconnect", "max_attempts"] => {
                Some(watch.reconnect.max_attempts.to_string())
            }
            _ => None,
        }
    }

    /// Set a configuration value by key path. Does not persist.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let parts: Vec<&str> = key.split('.').collect();
        let watch = &mut self.watch;

        match parts.as_slice() {
            ["server", "url"] => self.server.url = value.to_string(),
            ["server", "api_key"] => {
                self.server.api_key = Some(value.to_string()).filter(|v| !v.is_empty())
            }
            ["watch", "transport"] => {
                watch.transport = value.parse().map_err(anyhow::Error::msg)?;
            }
            ["watch", "polling"] => watch.polling = parse_value(key, value)?,
            ["watch", "poll_interval_secs"] => watch.poll_interval_secs = parse_value(key, value)?,
            ["watch", "keepalive_secs"] => watch.keepalive_secs = parse_value(key, value)?,
            ["watch", "connect_timeout_secs"] => {
                watch.connect_timeout_secs = parse_value(key, value)?
            }
            ["watch", "reconnect", "base_delay_ms"] => {
                watch.reconnect.base_delay_ms = parse_value(key, value)?
            }
            ["watch", "reconnect", "max_attempts"] => {
                watch.reconnect.max_attempts = parse_value(key, value)?
            }
            _ => anyhow::bail!("Unknown configuration key: {}", key),
        }

        Ok(())
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("Invalid value for {}: {}", key, value))
}
