// src/config.rs
use std::{env, fmt::Display, path::PathBuf, str::FromStr, time::Duration};

use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
#[error("invalid value {value:?} for {key}: {reason}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
    pub reason: String,
}

/// Runtime settings, read once at startup from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub static_dir: PathBuf,
    /// Used when a `create-poll` payload carries no `timeLimit`.
    pub default_time_limit: u64,
    /// Delay between the last student answering and the poll closing.
    pub all_answered_grace: Duration,
    pub history_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            database_url: None,
            db_max_connections: 5,
            static_dir: PathBuf::from("frontend/build"),
            default_time_limit: 60,
            all_answered_grace: Duration::from_millis(1000),
            history_limit: 50,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            host: env::var("HOST").unwrap_or(defaults.host),
            port: parse_or("PORT", defaults.port)?,
            database_url: env::var("DATABASE_URL").ok().filter(|url| !url.is_empty()),
            db_max_connections: parse_or("DB_MAX_CONNECTIONS", defaults.db_max_connections)?,
            static_dir: env::var("STATIC_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.static_dir),
            default_time_limit: parse_or("DEFAULT_TIME_LIMIT_SECS", defaults.default_time_limit)?,
            all_answered_grace: parse_or("ALL_ANSWERED_GRACE_MS", 1000u64)
                .map(Duration::from_millis)?,
            history_limit: parse_or("HISTORY_LIMIT", defaults.history_limit)?,
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_or<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + Display,
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
        Err(_) => {
            info!("{key} not set, using default: {default}");
            Ok(default)
        }
    }
}
