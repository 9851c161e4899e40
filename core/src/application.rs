//! Application bootstrap
//!
//! Loads configuration, connects the Postgres pool and wires every service
//! around a single shared store.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use sqlx::PgPool;

use crate::config::Config;
use crate::db;
use crate::monitor::{HeartbeatConfig, HeartbeatMonitor};
use crate::services::{InitializationService, ScheduleService};
use crate::store::{PostgresStore, ScheduleStore};
use crate::worker::{ActionExecutor, WorkerPool};

/// The qsched application instance with all services
pub struct Application {
    pub config: Config,
    pub pool: PgPool,
    pub store: Arc<dyn ScheduleStore>,
    pub schedule_service: ScheduleService,
    pub initialization_service: InitializationService,
}

impl Application {
    /// Create a new Application instance (pure instantiation, no I/O)
    pub fn new(config: Config, pool: PgPool) -> Self {
        let store: Arc<dyn ScheduleStore> = Arc::new(PostgresStore::new(pool.clone()));

        Self {
            config,
            pool: pool.clone(),
            schedule_service: ScheduleService::new(Arc::clone(&store)),
            initialization_service: InitializationService::new(pool),
            store,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Build an idle worker pool over the shared store.
    ///
    /// The pool is not started; callers pick the initial size.
    pub fn worker_pool(&self, executor: Arc<dyn ActionExecutor>) -> WorkerPool {
        WorkerPool::new(
            Arc::clone(&self.store),
            executor,
            self.config.worker.poll_interval(),
        )
    }

    /// Build a heartbeat monitor from the `monitor` config section.
    pub fn heartbeat_monitor(&self) -> HeartbeatMonitor {
        HeartbeatMonitor::new(
            Arc::clone(&self.store),
            HeartbeatConfig::from(&self.config.monitor),
        )
    }
}

/// Options for initializing qsched
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Database URL (overrides config file and env vars)
    pub database_url: Option<String>,

    /// Config file path (overrides default search)
    pub config_path: Option<PathBuf>,

    /// Whether to run migrations before returning
    pub auto_migrate: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            database_url: None,
            config_path: None,
            auto_migrate: true,
        }
    }
}

/// Builder for constructing InitOptions
#[derive(Default)]
pub struct InitBuilder {
    options: InitOptions,
}

impl InitBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.options.database_url = Some(url.into());
        self
    }

    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn auto_migrate(mut self, auto: bool) -> Self {
        self.options.auto_migrate = auto;
        self
    }

    pub fn options(&self) -> &InitOptions {
        &self.options
    }

    pub async fn init(self) -> Result<Application> {
        initialize(self.options).await
    }
}

/// Initialize qsched and return an Application instance
pub async fn initialize(options: InitOptions) -> Result<Application> {
    let config = Config::builder()
        .database_url(options.database_url)
        .config_path(options.config_path)
        .build()?;

    let pool = db::create_pool(&config.database).await?;
    let app = Application::new(config, pool);

    app.initialization_service
        .initialize(options.auto_migrate)
        .await?;

    Ok(app)
}
