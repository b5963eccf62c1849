use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use redis::AsyncCommands;

pub use self::config::RedisConfig;
use crate::auth::TtlStore;

mod config;

/// Shared [`TtlStore`] on top of Redis key expiry.
#[derive(Clone)]
pub struct RedisClient {
    client: redis::aio::ConnectionManager,
    key_prefix: String,
}

impl RedisClient {
    pub async fn new(url: &str, config: &RedisConfig) -> anyhow::Result<Self> {
        let client = redis::Client::open(url).context("failed to create Redis client")?;

        let manager = redis::aio::ConnectionManager::new(client)
            .await
            .context("failed to connect to Redis")?;

        Ok(Self {
            client: manager,
            key_prefix: config.key_prefix.clone(),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.key_prefix)
    }
}

/// `SET EX` takes whole seconds; rounded up so an entry never expires early.
fn expiry_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1)
}

#[async_trait]
impl TtlStore for RedisClient {
    async fn put(&self, key: &str, ttl: Duration) -> anyhow::Result<()> {
        let mut conn = self.client.clone();
        let _: () = conn
            .set_ex(self.key(key), 1u8, expiry_secs(ttl))
            .await
            .context("failed to store key in Redis")?;
        Ok(())
    }

    async fn contains(&self, key: &str) -> anyhow::Result<bool> {
        let mut conn = self.client.clone();
        let exists: bool = conn
            .exists(self.key(key))
            .await
            .context("failed to check key in Redis")?;
        Ok(exists)
    }

    async fn take(&self, key: &str) -> anyhow::Result<bool> {
        let mut conn = self.client.clone();
        let deleted: i64 = conn
            .del(self.key(key))
            .await
            .context("failed to delete key from Redis")?;
        Ok(deleted > 0)
    }
}
