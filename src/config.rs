// src/config.rs

//! Manages client configuration: loading from TOML, defaults, and validation.

use crate::core::Driver;
use crate::core::address::Address;
use crate::core::cache::CacheConfig;
use crate::core::cluster::{ClusterConfig, ReconnectConfig};
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;

/// Where and how wide to connect.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// A `postgres://` URI or a `key=value` conninfo string.
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// The shared deadline for the initial handshakes of the whole pool.
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            pool_size: default_pool_size(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

fn default_url() -> String {
    "postgres://postgres@localhost:5432/postgres".to_string()
}
fn default_pool_size() -> usize {
    4
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_log_level() -> String {
    "info".to_string()
}

/// The top-level configuration file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Named query templates, loaded into the `Driver`.
    #[serde(default)]
    pub queries: BTreeMap<String, String>,
    /// Constants available to templates as `#NAME`.
    #[serde(default)]
    pub constants: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            database: DatabaseConfig::default(),
            cache: CacheConfig::default(),
            reconnect: ReconnectConfig::default(),
            queries: BTreeMap::new(),
            constants: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid configuration in '{path}'"))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration to ensure logical consistency.
    fn validate(&self) -> Result<()> {
        if self.database.pool_size == 0 {
            return Err(anyhow!("database.pool_size cannot be 0"));
        }
        if self.database.url.trim().is_empty() {
            return Err(anyhow!("database.url cannot be empty"));
        }
        if self.database.connect_timeout.is_zero() {
            return Err(anyhow!("database.connect_timeout cannot be 0"));
        }
        if self.cache.cleanup_interval.is_zero() {
            return Err(anyhow!("cache.cleanup_interval cannot be 0"));
        }
        if self.reconnect.initial_delay.is_zero() {
            return Err(anyhow!("reconnect.initial_delay cannot be 0"));
        }
        if self.reconnect.max_delay < self.reconnect.initial_delay {
            return Err(anyhow!(
                "reconnect.max_delay ({:?}) cannot be shorter than reconnect.initial_delay ({:?})",
                self.reconnect.max_delay,
                self.reconnect.initial_delay
            ));
        }
        for (name, template) in &self.queries {
            if template.trim().is_empty() {
                return Err(anyhow!("query template '{name}' is empty"));
            }
        }
        Ok(())
    }

    /// Parses `database.url`. Malformed parts are logged and skipped.
    pub fn address(&self) -> Address {
        let (address, _problems) = Address::parse(&self.database.url);
        address
    }

    pub fn cluster_config(&self) -> ClusterConfig {
        ClusterConfig {
            connect_timeout: self.database.connect_timeout,
            cache: self.cache.clone(),
            reconnect: self.reconnect.clone(),
        }
    }

    pub fn driver(&self) -> Driver {
        Driver::from_tables(&self.queries, &self.constants)
    }
}
