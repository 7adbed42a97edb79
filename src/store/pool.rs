use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::config::DatabaseConfig;

/// Manages the Postgres connection pool backing the session store.
pub struct StorePool {
    cfg: DatabaseConfig,
    pool: Option<PgPool>,
}

impl StorePool {
    /// Creates a new pool manager with the given configuration.
    pub fn new(cfg: DatabaseConfig) -> Self {
        Self { cfg, pool: None }
    }

    /// Opens the connection pool and verifies connectivity with a ping.
    pub async fn start(&mut self) -> Result<()> {
        let dsn = self.build_dsn();

        let pool = PgPoolOptions::new()
            .max_connections(self.cfg.max_connections)
            .acquire_timeout(self.cfg.connect_timeout)
            .connect(&dsn)
            .await
            .context("opening Postgres connection")?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .context("pinging Postgres")?;

        tracing::info!(
            endpoint = %self.cfg.endpoint,
            database = %self.cfg.database,
            "session store connected"
        );

        self.pool = Some(pool);

        Ok(())
    }

    /// Returns the connection pool, if started.
    pub fn pool(&self) -> Option<&PgPool> {
        self.pool.as_ref()
    }

    /// Closes the connection pool, waiting for checked-out connections.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }

        Ok(())
    }

    /// Builds a Postgres connection URL from configuration.
    ///
    /// Format: `postgres://[user[:pass]@]host:port/database`
    fn build_dsn(&self) -> String {
        let mut dsn = "postgres://".to_string();

        if !self.cfg.username.is_empty() {
            dsn.push_str(&self.cfg.username);
            if !self.cfg.password.is_empty() {
                dsn.push(':');
                dsn.push_str(&self.cfg.password);
            }
            dsn.push('@');
        }

        dsn.push_str(&self.cfg.endpoint);
        dsn.push('/');
        dsn.push_str(&self.cfg.database);

        dsn
    }
}
