use anyhow::Context;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

pub use self::config::PgConfig;

mod config;
mod user;

#[derive(Clone)]
pub struct SqlxClient {
    pool: PgPool,
}

impl SqlxClient {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects to PostgreSQL and applies pending migrations.
    pub async fn connect(url: &str, config: &PgConfig) -> anyhow::Result<Self> {
        tracing::info!("connecting to PostgreSQL...");
        let pool = PgPoolOptions::new()
            .max_connections(config.db_pool_size)
            .connect(url)
            .await
            .context("failed to connect to PostgreSQL")?;
        tracing::info!("PostgreSQL connected");

        tracing::info!("running database migrations");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run database migrations")?;
        tracing::info!("database migrations complete");

        Ok(Self::new(pool))
    }
}
