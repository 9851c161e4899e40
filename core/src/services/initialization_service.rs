use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::db;

/// Service for initialization operations (migrations)
#[derive(Clone)]
pub struct InitializationService {
    pool: PgPool,
}

impl InitializationService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run initialization tasks
    pub async fn initialize(&self, auto_migrate: bool) -> Result<()> {
        if auto_migrate {
            self.run_migrations()
                .await
                .context("Failed to run automatic migrations")?;
        }

        Ok(())
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        db::migrate(&self.pool).await
    }
}
