//! Configuration loading
//!
//! Layers, lowest to highest priority:
//! 1. Built-in defaults
//! 2. TOML file (`--config`, `QSCHED_CONFIG_PATH`, or `./qsched.toml` if present)
//! 3. Environment variables: `QSCHED_<SECTION>__<KEY>` and `QSCHED_DATABASE_URL`
//! 4. Explicit builder overrides (CLI flags)

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::{monitor, worker};

const ENV_PREFIX: &str = "QSCHED";
const CONFIG_PATH_ENV: &str = "QSCHED_CONFIG_PATH";
const DATABASE_URL_ENV: &str = "QSCHED_DATABASE_URL";
const DEFAULT_CONFIG_FILE: &str = "qsched";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("database url is not configured (set {DATABASE_URL_ENV} or database.url)")]
    MissingDatabaseUrl,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub worker: WorkerConfig,
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            min_connections: 1,
            acquire_timeout_secs: 5,
            idle_timeout_secs: 600,
            max_lifetime_secs: 1800,
        }
    }
}

impl DatabaseConfig {
    pub fn require_url(&self) -> Result<&str, ConfigError> {
        self.url
            .as_deref()
            .filter(|url| !url.is_empty())
            .ok_or(ConfigError::MissingDatabaseUrl)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Initial pool size.
    pub count: usize,
    pub poll_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 1,
            poll_interval_secs: 30,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_secs: u64,
    /// A running job whose claim is older than this is considered abandoned.
    pub max_running_secs: u64,
    pub renew_concurrency: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            max_running_secs: 300,
            renew_concurrency: 10,
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn max_running(&self) -> Duration {
        Duration::from_secs(self.max_running_secs)
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Load with no explicit overrides.
    pub fn load() -> Result<Self, ConfigError> {
        Self::builder().build()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "worker.poll_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.monitor.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "monitor.poll_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.worker.poll_interval() > worker::MAX_POLL_INTERVAL {
            return Err(ConfigError::Invalid(format!(
                "worker.poll_interval_secs must be at most {}",
                worker::MAX_POLL_INTERVAL.as_secs()
            )));
        }
        if self.monitor.poll_interval() > monitor::MAX_POLL_INTERVAL {
            return Err(ConfigError::Invalid(format!(
                "monitor.poll_interval_secs must be at most {}",
                monitor::MAX_POLL_INTERVAL.as_secs()
            )));
        }
        if self.monitor.max_running() > monitor::MAX_RUNNING_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "monitor.max_running_secs must be at most {}",
                monitor::MAX_RUNNING_LIMIT.as_secs()
            )));
        }
        if self.monitor.renew_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "monitor.renew_concurrency must be greater than zero".to_string(),
            ));
        }
        if self.database.min_connections > self.database.max_connections {
            return Err(ConfigError::Invalid(format!(
                "database.min_connections ({}) exceeds database.max_connections ({})",
                self.database.min_connections, self.database.max_connections
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    database_url: Option<String>,
    config_path: Option<PathBuf>,
    skip_env: bool,
}

impl ConfigBuilder {
    pub fn database_url(mut self, url: Option<String>) -> Self {
        self.database_url = url;
        self
    }

    pub fn config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    /// Ignore process environment and `.env` files. Used by tests.
    pub fn skip_env(mut self, skip: bool) -> Self {
        self.skip_env = skip;
        self
    }

    pub fn build(self) -> Result<Config, ConfigError> {
        if !self.skip_env {
            // A missing .env file is normal.
            let _ = dotenvy::dotenv();
        }

        let mut builder = config::Config::builder();

        let explicit_path = self.config_path.or_else(|| {
            if self.skip_env {
                None
            } else {
                env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from)
            }
        });
        builder = match explicit_path {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None if !self.skip_env => {
                builder.add_source(config::File::with_name(DEFAULT_CONFIG_FILE).required(false))
            }
            None => builder,
        };

        if !self.skip_env {
            builder = builder.add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );
            if let Ok(url) = env::var(DATABASE_URL_ENV) {
                builder = builder.set_override("database.url", url)?;
            }
        }

        if let Some(url) = self.database_url {
            builder = builder.set_override("database.url", url)?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }
}
