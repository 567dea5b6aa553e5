//! Server configuration.
//!
//! Sources, lowest precedence first:
//!
//! | Source | Location |
//! |--------|----------|
//! | defaults | built in |
//! | TOML file | `$DAVQ_CONFIG`, else `/etc/davq/node.toml` |
//! | environment | `DAVQ_<FIELD>`, e.g. `DAVQ_DATABASE_URL`, `DAVQ_POLL_INTERVAL_SECONDS` |
//!
//! Queue options live under a `[queue]` table in the file and use the same
//! field names (uppercased) in the environment.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use davq_core::{QueueConfig, QueueConfigLayer};

pub const CONFIG_PATH_ENV: &str = "DAVQ_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/davq/node.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Partial configuration produced by one source.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfigLayer {
    pub database_url: Option<String>,
    pub max_connections: Option<u32>,
    pub redis_url: Option<String>,
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub log_format: Option<String>,
    pub queue: QueueConfigLayer,
}

impl ServerConfigLayer {
    pub fn merge(&mut self, other: Self) {
        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $(if other.$field.is_some() {
                    self.$field = other.$field;
                })*
            };
        }

        take!(
            database_url,
            max_connections,
            redis_url,
            hostname,
            port,
            log_format
        );
        self.queue.merge(other.queue);
    }

    pub fn finalize(self) -> Result<ServerConfig, ConfigError> {
        let database_url = self.database_url.ok_or_else(|| ConfigError::InvalidValue {
            key: "database_url".to_string(),
            message: "is required".to_string(),
        })?;

        let max_connections = self.max_connections.unwrap_or(10);
        if max_connections == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_connections".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        let log_format = self.log_format.unwrap_or_else(|| "json".to_string());
        if !matches!(log_format.as_str(), "json" | "pretty") {
            return Err(ConfigError::InvalidValue {
                key: "log_format".to_string(),
                message: format!("expected 'json' or 'pretty', got '{log_format}'"),
            });
        }

        let queue = self
            .queue
            .finalize()
            .map_err(|e| ConfigError::InvalidValue {
                key: "queue".to_string(),
                message: e.to_string(),
            })?;

        Ok(ServerConfig {
            database_url,
            max_connections,
            redis_url: self.redis_url,
            hostname: self.hostname.unwrap_or_else(|| "localhost".to_string()),
            port: self.port.unwrap_or(8008),
            log_format,
            queue,
        })
    }
}

/// Finalized node configuration.
#[derive(Clone, PartialEq)]
pub struct ServerConfig {
    pub database_url: String,
    pub max_connections: u32,
    /// When set, distributed locks use Redis instead of the in-process cache.
    pub redis_url: Option<String>,
    pub hostname: String,
    pub port: u16,
    /// `json` or `pretty`.
    pub log_format: String,
    pub queue: QueueConfig,
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("database_url", &"<redacted>")
            .field("max_connections", &self.max_connections)
            .field("redis_url", &self.redis_url.as_ref().map(|_| "<redacted>"))
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("log_format", &self.log_format)
            .field("queue", &self.queue)
            .finish()
    }
}

/// Source precedence levels (higher = overrides lower).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precedence {
    Defaults = 10,
    ConfigFile = 20,
    Environment = 50,
}

pub trait ConfigSource: Send + Sync {
    fn name(&self) -> &'static str;
    fn precedence(&self) -> Precedence;
    fn load(&self) -> Result<ServerConfigLayer, ConfigError>;
}

/// TOML file source. A missing file is skipped unless `required`.
pub struct TomlSource {
    path: PathBuf,
    required: bool,
}

impl TomlSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

impl ConfigSource for TomlSource {
    fn name(&self) -> &'static str {
        "toml-config"
    }

    fn precedence(&self) -> Precedence {
        Precedence::ConfigFile
    }

    fn load(&self) -> Result<ServerConfigLayer, ConfigError> {
        if !self.required && !self.path.exists() {
            debug!(path = %self.path.display(), "config file not found, skipping");
            return Ok(ServerConfigLayer::default());
        }

        debug!(path = %self.path.display(), "loading config file");
        let content = std::fs::read_to_string(&self.path).map_err(|e| ConfigError::FileRead {
            path: self.path.clone(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::TomlParse {
            path: self.path.clone(),
            source: e,
        })
    }
}

type Lookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Environment source. Convention: `DAVQ_<FIELD>`.
pub struct EnvSource {
    lookup: Lookup,
}

impl EnvSource {
    /// Read the process environment.
    pub fn system() -> Self {
        Self {
            lookup: Box::new(|name| std::env::var(name).ok()),
        }
    }

    /// Read from a fixed map instead of the process environment.
    pub fn from_map(vars: HashMap<String, String>) -> Self {
        Self {
            lookup: Box::new(move |name| vars.get(name).cloned()),
        }
    }

    fn var(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|s| !s.is_empty())
    }

    fn parsed<T>(&self, name: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.var(name) {
            Some(v) => v.parse().map(Some).map_err(|e| ConfigError::InvalidValue {
                key: name.to_string(),
                message: format!("invalid value '{v}': {e}"),
            }),
            None => Ok(None),
        }
    }
}

impl ConfigSource for EnvSource {
    fn name(&self) -> &'static str {
        "environment"
    }

    fn precedence(&self) -> Precedence {
        Precedence::Environment
    }

    fn load(&self) -> Result<ServerConfigLayer, ConfigError> {
        debug!("loading environment variables");
        Ok(ServerConfigLayer {
            database_url: self.var("DAVQ_DATABASE_URL"),
            max_connections: self.parsed("DAVQ_MAX_CONNECTIONS")?,
            redis_url: self.var("DAVQ_REDIS_URL"),
            hostname: self.var("DAVQ_HOSTNAME"),
            port: self.parsed("DAVQ_PORT")?,
            log_format: self.var("DAVQ_LOG_FORMAT"),
            queue: QueueConfigLayer {
                poll_interval_seconds: self.parsed("DAVQ_POLL_INTERVAL_SECONDS")?,
                error_backoff_seconds: self.parsed("DAVQ_ERROR_BACKOFF_SECONDS")?,
                retry_count: self.parsed("DAVQ_RETRY_COUNT")?,
                lock_timeout_seconds: self.parsed("DAVQ_LOCK_TIMEOUT_SECONDS")?,
                lock_retry_interval_seconds: self.parsed("DAVQ_LOCK_RETRY_INTERVAL_SECONDS")?,
                lock_expire_seconds: self.parsed("DAVQ_LOCK_EXPIRE_SECONDS")?,
                cleanup_period_days: self.parsed("DAVQ_CLEANUP_PERIOD_DAYS")?,
                sync_token_lifetime_days: self.parsed("DAVQ_SYNC_TOKEN_LIFETIME_DAYS")?,
                cleanup_batch_size: self.parsed("DAVQ_CLEANUP_BATCH_SIZE")?,
                heartbeat_interval_seconds: self.parsed("DAVQ_HEARTBEAT_INTERVAL_SECONDS")?,
                node_freshness_seconds: self.parsed("DAVQ_NODE_FRESHNESS_SECONDS")?,
                group_cacher_update_seconds: self.parsed("DAVQ_GROUP_CACHER_UPDATE_SECONDS")?,
            },
        })
    }
}

/// Merge `sources` in precedence order and finalize.
pub fn load_config(mut sources: Vec<Box<dyn ConfigSource>>) -> Result<ServerConfig, ConfigError> {
    sources.sort_by_key(|s| s.precedence());

    let mut layer = ServerConfigLayer::default();
    for source in &sources {
        debug!(source = source.name(), "applying config source");
        layer.merge(source.load()?);
    }
    layer.finalize()
}

/// Standard sources: the config file (required when named by
/// `DAVQ_CONFIG`) and the process environment.
pub fn default_sources() -> Vec<Box<dyn ConfigSource>> {
    let file = match std::env::var(CONFIG_PATH_ENV) {
        Ok(path) if !path.is_empty() => TomlSource::new(path).required(),
        _ => TomlSource::new(DEFAULT_CONFIG_PATH),
    };
    vec![Box::new(file) as Box<dyn ConfigSource>, Box::new(EnvSource::system())]
}
