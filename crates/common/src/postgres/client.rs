use anyhow::{Context, Result};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use std::time::Duration;
use tokio_postgres::NoTls;
use tracing::{debug, info};

const SCHEMA: &str = include_str!("../../migrations/0001_vital_states.sql");

/// PostgreSQL client wrapper with connection pooling
#[derive(Clone)]
pub struct PostgresClient {
    pool: Pool,
}

impl PostgresClient {
    /// Build a pool from a `postgres://` URL. `timeout` bounds both waiting
    /// for a pooled connection and opening a new one.
    pub fn from_url(database_url: &str, max_pool_size: usize, timeout: Duration) -> Result<Self> {
        let pg_config: tokio_postgres::Config = database_url
            .parse()
            .context("invalid database url")?;

        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );

        let pool = Pool::builder(manager)
            .max_size(max_pool_size)
            .runtime(Runtime::Tokio1)
            .wait_timeout(Some(timeout))
            .create_timeout(Some(timeout))
            .build()
            .context("failed to build postgres pool")?;

        Ok(Self { pool })
    }

    pub async fn ping(&self) -> Result<()> {
        let client = self.get_connection().await?;
        client.execute("SELECT 1", &[]).await?;
        debug!("postgreSQL connection successful");
        Ok(())
    }

    /// Create the vitals tables if they are missing.
    pub async fn ensure_schema(&self) -> Result<()> {
        let client = self.get_connection().await?;
        client
            .batch_execute(SCHEMA)
            .await
            .context("failed to apply vitals schema")?;
        info!("vitals schema ready");
        Ok(())
    }

    pub async fn get_connection(&self) -> Result<deadpool_postgres::Client> {
        self.pool
            .get()
            .await
            .context("failed to get postgres connection from pool")
    }
}
