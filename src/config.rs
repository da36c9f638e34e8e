//! Service configuration
//!
//! Loaded from a YAML file with `TAGSRV_`-prefixed environment overrides.
//! Configuration failures are fatal at startup; the service never proceeds
//! to connect with an invalid config.

use crate::error::{GatewayError, Result};
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "config/tagsrv.yaml";

/// Service identity and logging
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Default log level, overridable via RUST_LOG or --log-level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_service_name() -> String {
    "tagsrv".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
        }
    }
}

/// Field-protocol session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldConfig {
    /// Protocol driver; "sim" is the built-in simulated session
    #[serde(default = "default_driver")]
    pub driver: String,
    pub endpoint: String,
    /// Simulated data-change publish interval; 0 disables the feed
    #[serde(default = "default_publish_interval_ms")]
    pub publish_interval_ms: u64,
}

fn default_driver() -> String {
    "sim".to_string()
}

fn default_publish_interval_ms() -> u64 {
    500
}

/// One monitored point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagConfig {
    pub name: String,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub unit: String,
}

/// Storage backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Persistence interval in seconds; non-positive values are corrected
    /// to the default at worker startup rather than rejected
    #[serde(default = "default_log_interval")]
    pub log_interval_secs: i64,
    /// Fixed pause before a reconnect attempt
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff_secs: u64,
}

fn default_db_path() -> String {
    "data/tagsrv.db".to_string()
}

fn default_log_interval() -> i64 {
    60
}

fn default_reconnect_backoff() -> u64 {
    2
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_db_path(),
            log_interval_secs: default_log_interval(),
            reconnect_backoff_secs: default_reconnect_backoff(),
        }
    }
}

/// HTTP query surface settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
}

fn default_http_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    5000
}

fn default_true() -> bool {
    true
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_http_host(),
            port: default_http_port(),
            cors_enabled: true,
        }
    }
}

/// Complete gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    pub field: FieldConfig,
    pub tags: Vec<TagConfig>,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

impl Config {
    /// Load configuration from a YAML file merged with env overrides
    pub fn load(path: &str) -> Result<Self> {
        let config: Config = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("TAGSRV_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration completeness
    pub fn validate(&self) -> Result<()> {
        if self.field.endpoint.is_empty() {
            return Err(GatewayError::MissingConfig("field.endpoint".to_string()));
        }

        if self.tags.is_empty() {
            return Err(GatewayError::MissingConfig("tags".to_string()));
        }

        for (i, tag) in self.tags.iter().enumerate() {
            if tag.name.is_empty() {
                return Err(GatewayError::MissingConfig(format!("tags[{}].name", i)));
            }
            if tag.node_id.is_empty() {
                return Err(GatewayError::MissingConfig(format!(
                    "tags[{}].node_id (tag '{}')",
                    i, tag.name
                )));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for tag in &self.tags {
            if !seen.insert(tag.name.as_str()) {
                return Err(GatewayError::Configuration(format!(
                    "Duplicate tag name: {}",
                    tag.name
                )));
            }
        }

        Ok(())
    }
}
