//! Server configuration read from the environment.

use std::path::PathBuf;
use std::time::Duration;

use crate::session::{DispatchConfig, SessionConfig};
use crate::storage::StorageConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value:?} ({reason})")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid configuration: {0}")]
    Inconsistent(String),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub storage: StorageConfig,
    pub dispatch: DispatchConfig,
    pub session: SessionConfig,
    /// JSON file used to populate the in-memory directory
    pub directory_seed: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            storage: StorageConfig::default(),
            dispatch: DispatchConfig::default(),
            session: SessionConfig::default(),
            directory_seed: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(port) = parse_var(&lookup, "PORT")? {
            config.port = port;
        }
        if let Some(path) = lookup("STORAGE_PATH").filter(|p| !p.trim().is_empty()) {
            config.storage = StorageConfig::new(path);
        }
        if let Some(bytes) = parse_var(&lookup, "STORAGE_CACHE_BYTES")? {
            config.storage = config.storage.with_cache_size(bytes);
        }
        if let Some(ms) = parse_var(&lookup, "STORAGE_FLUSH_INTERVAL_MS")? {
            config.storage = config.storage.with_flush_interval(ms);
        }
        if let Some(capacity) = parse_var(&lookup, "DISPATCH_QUEUE_CAPACITY")? {
            config.dispatch = config.dispatch.with_queue_capacity(capacity);
        }
        if let Some(secs) = parse_var(&lookup, "DELIVERY_TIMEOUT_SECS")? {
            config.dispatch = config.dispatch.with_delivery_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = parse_var(&lookup, "HEARTBEAT_INTERVAL_SECS")? {
            config.session = config.session.with_heartbeat_interval(Duration::from_secs(secs));
        }
        if let Some(secs) = parse_var(&lookup, "READ_TIMEOUT_SECS")? {
            config.session = config.session.with_read_timeout(Duration::from_secs(secs));
        }
        if let Some(capacity) = parse_var(&lookup, "SESSION_OUTBOX_CAPACITY")? {
            config.session = config.session.with_outbox_capacity(capacity);
        }
        config.directory_seed = lookup("DIRECTORY_SEED")
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatch.queue_capacity == 0 {
            return Err(ConfigError::Inconsistent(
                "dispatch queue capacity must be positive".to_string(),
            ));
        }
        if self.session.outbox_capacity == 0 {
            return Err(ConfigError::Inconsistent(
                "session outbox capacity must be positive".to_string(),
            ));
        }
        if self.dispatch.delivery_timeout.is_zero() || self.session.heartbeat_interval.is_zero() {
            return Err(ConfigError::Inconsistent(
                "timeouts and intervals must be positive".to_string(),
            ));
        }
        if self.session.read_timeout <= self.session.heartbeat_interval {
            return Err(ConfigError::Inconsistent(format!(
                "read timeout ({:?}) must exceed heartbeat interval ({:?})",
                self.session.read_timeout, self.session.heartbeat_interval
            )));
        }
        Ok(())
    }
}

fn parse_var<F, T>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                name,
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}
