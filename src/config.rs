use serde::Deserialize;
use std::fs;

use crate::error::{ConverterError, Result};

fn default_batch_size() -> u32 {
    250
}
fn default_max_batches() -> u32 {
    0
}
fn default_max_queue_size() -> usize {
    100
}
fn default_parser_name() -> String {
    "fixprice".to_string()
}
fn default_source() -> String {
    "receiver".to_string()
}
fn default_bind_address() -> String {
    "0.0.0.0:8088".to_string()
}
fn default_timeout_ms() -> u64 {
    10_000
}
fn default_log_format() -> String {
    "pretty".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_dir() -> String {
    "logs".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReceiverConfig {
    pub db: String,
    #[serde(default = "default_parser_name")]
    pub default_parser_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    pub db: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SyncConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_max_batches")]
    pub max_batches: u32,
}

impl SyncConfig {
    fn with_defaults(self) -> Self {
        SyncConfig {
            batch_size: if self.batch_size == 0 {
                default_batch_size()
            } else {
                self.batch_size
            },
            max_batches: self.max_batches,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            max_queue_size: default_max_queue_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    pub auth_token: Option<String>,
    pub default_receiver_db: Option<String>,
    pub default_catalog_db: Option<String>,
    #[serde(default = "default_parser_name")]
    pub default_parser_name: String,
    #[serde(default = "default_batch_size")]
    pub default_batch_size: u32,
    #[serde(default = "default_max_batches")]
    pub default_max_batches: u32,
    #[serde(default = "default_source")]
    pub default_source: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            bind_address: default_bind_address(),
            auth_token: None,
            default_receiver_db: None,
            default_catalog_db: None,
            default_parser_name: default_parser_name(),
            default_batch_size: default_batch_size(),
            default_max_batches: default_max_batches(),
            default_source: default_source(),
        }
    }
}

impl HttpConfig {
    fn apply_env(mut self) -> Self {
        if let Ok(token) = std::env::var("CONVERTER_HTTP_AUTH_TOKEN") {
            if !token.trim().is_empty() {
                self.auth_token = Some(token);
            }
        }
        if self.bind_address.trim().is_empty() {
            self.bind_address = default_bind_address();
        }
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub base_url: String,
    pub api_token: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub fail_on_error: bool,
}

impl StorageConfig {
    fn apply_env(mut self) -> Self {
        if let Ok(token) = std::env::var("CONVERTER_STORAGE_API_TOKEN") {
            if !token.trim().is_empty() {
                self.api_token = token;
            }
        }
        self
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_dir")]
    pub directory: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub receiver: Option<ReceiverConfig>,
    pub catalog: Option<CatalogConfig>,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub http: HttpConfig,
    pub storage: Option<StorageConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Loads configuration from a TOML file, falling back to documented
    /// defaults for every optional section. A missing required DSN is only
    /// an error once a caller actually asks for it.
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConverterError::Config(format!("failed to read config file '{path}': {e}")))?;
        let mut config: Config = toml::from_str(&content)?;
        config.sync = config.sync.with_defaults();
        config.http = config.http.apply_env();
        config.storage = config.storage.map(StorageConfig::apply_env);
        Ok(config)
    }

    pub fn receiver_db(&self) -> Result<&str> {
        self.receiver
            .as_ref()
            .map(|r| r.db.as_str())
            .ok_or_else(|| ConverterError::Config("[receiver] db is required".to_string()))
    }

    pub fn catalog_db(&self) -> Result<&str> {
        self.catalog
            .as_ref()
            .map(|c| c.db.as_str())
            .ok_or_else(|| ConverterError::Config("[catalog] db is required".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_minimal_config_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [receiver]
            db = "receiver.sqlite3"
            [catalog]
            db = "catalog.sqlite3"
            "#
        )
        .unwrap();

        let config = Config::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.receiver_db().unwrap(), "receiver.sqlite3");
        assert_eq!(config.catalog_db().unwrap(), "catalog.sqlite3");
        assert_eq!(config.sync.batch_size, 250);
        assert_eq!(config.queue.max_queue_size, 100);
        assert_eq!(config.http.bind_address, "0.0.0.0:8088");
    }

    #[test]
    fn missing_dsn_is_a_config_error() {
        let config = Config {
            receiver: None,
            catalog: None,
            sync: SyncConfig::default(),
            queue: QueueConfig::default(),
            http: HttpConfig::default(),
            storage: None,
            logging: LoggingConfig::default(),
        };
        assert!(config.receiver_db().is_err());
    }
}
