use std::future::Future;
use std::sync::Arc;

use anyhow::Context;

use crate::api::config::ApiSecrets;
use crate::api::state::ApiState;
use crate::auth::{GoogleOAuth, TtlStore};
use crate::config::AppConfig;
use crate::redis::RedisClient;
use crate::sqlx::SqlxClient;

pub mod config;
pub mod controllers;
pub mod endpoint;
pub mod models;
pub mod state;

/// Runs the HTTP API until `shutdown` resolves.
pub async fn http_service<F>(config: AppConfig, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let secrets = ApiSecrets::from_env()?;

    let db_url = std::env::var("DATABASE_URL").context("DATABASE_URL not set")?;
    let sqlx_client = SqlxClient::connect(&db_url, &config.postgres).await?;

    let shared_store = match std::env::var("REDIS_URL") {
        Ok(redis_url) => {
            tracing::info!("connecting to Redis...");
            let redis_client = RedisClient::new(&redis_url, &config.redis)
                .await
                .context("failed to connect to Redis")?;
            tracing::info!("Redis connected");
            Some(Arc::new(redis_client) as Arc<dyn TtlStore>)
        }
        Err(_) => None,
    };

    let http_client = reqwest::Client::builder()
        .timeout(config.oauth.http_timeout)
        .build()
        .context("failed to build http client")?;
    let oauth = GoogleOAuth::new(&config.oauth, &secrets, http_client)?;

    let state = ApiState::builder()
        .with_directory(Arc::new(sqlx_client))
        .with_oauth_provider(Arc::new(oauth))
        .with_api_config(config.api)
        .with_auth_config(config.auth)
        .with_oauth_config(config.oauth)
        .with_shared_store(shared_store)
        .build(&secrets)?;
    drop(secrets);

    let endpoint = state.bind_endpoint().await?;
    tracing::info!(listen_addr = %state.config().listen_addr, "API server started");

    let grace = state.config().shutdown_grace;
    let result = endpoint
        .serve({
            let state = state.clone();
            async move {
                shutdown.await;
                tracing::info!(?grace, "draining in-flight requests");
                state.cancel_requests_after(grace);
            }
        })
        .await;

    state.shutdown().await;
    tracing::info!("API server stopped");

    result.context("API server failed")
}
