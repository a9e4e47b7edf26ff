//! Redis cache store

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::info;

use crate::store::CacheStore;
use crate::Result;

/// Redis-backed [`CacheStore`]
#[derive(Clone)]
pub struct RedisCache {
    redis: ConnectionManager,
}

impl RedisCache {
    /// Wrap an existing connection manager
    pub fn new(redis: ConnectionManager) -> Self {
        RedisCache { redis }
    }

    /// Open a managed connection to `url`
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to Redis...");
        let client = redis::Client::open(url)?;
        let redis = ConnectionManager::new(client).await?;
        info!("Redis connection manager created");
        Ok(Self::new(redis))
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.redis.clone().get::<_, Option<String>>(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.redis.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            // Redis rejects EX 0
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        cmd.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self
            .redis
            .clone()
            .hget::<_, _, Option<String>>(key, field)
            .await?)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.redis
            .clone()
            .hset::<_, _, _, ()>(key, field, value)
            .await?;
        Ok(())
    }
}
