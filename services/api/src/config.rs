//! services/api/src/config.rs
//!
//! Defines the application's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Where sessions, players and answers are kept.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageBackend {
    Postgres { url: String, max_connections: u32 },
    Memory,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub storage: StorageBackend,
    pub log_level: Level,
    /// Capacity of each subscriber's queue in the broadcast hub.
    pub subscriber_queue_capacity: usize,
    /// Deadline for a single WebSocket write, also the liveness probe period.
    pub write_deadline: Duration,
    /// Attempts for a transaction that fails with a serialization conflict.
    pub tx_retry_limit: u32,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // --- Server ---
        let bind_address: SocketAddr = parse_or(&lookup, "BIND_ADDRESS", "0.0.0.0:3000")?;

        let log_level_str = lookup("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        // --- Storage ---
        let storage_kind = lookup("STORAGE").unwrap_or_else(|| "postgres".to_string());
        let storage = match storage_kind.to_lowercase().as_str() {
            "postgres" => StorageBackend::Postgres {
                url: lookup("DATABASE_URL")
                    .ok_or_else(|| ConfigError::MissingVar("DATABASE_URL".to_string()))?,
                max_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", "5")?,
            },
            "memory" => StorageBackend::Memory,
            other => {
                return Err(ConfigError::InvalidValue(
                    "STORAGE".to_string(),
                    format!("'{}' is neither 'postgres' nor 'memory'", other),
                ))
            }
        };

        // --- Live updates ---
        let subscriber_queue_capacity: usize =
            parse_or(&lookup, "SUBSCRIBER_QUEUE_CAPACITY", "100")?;
        if subscriber_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "SUBSCRIBER_QUEUE_CAPACITY".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        let write_deadline_ms: u64 = parse_or(&lookup, "WRITE_DEADLINE_MS", "10000")?;
        if write_deadline_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "WRITE_DEADLINE_MS".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        let tx_retry_limit: u32 = parse_or(&lookup, "TX_RETRY_LIMIT", "5")?;

        Ok(Self {
            bind_address,
            storage,
            log_level,
            subscriber_queue_capacity,
            write_deadline: Duration::from_millis(write_deadline_ms),
            tx_retry_limit: tx_retry_limit.max(1),
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: &str) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(key).unwrap_or_else(|| default.to_string());
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidValue(key.to_string(), e.to_string()))
}
