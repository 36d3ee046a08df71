//! Redis backend for multi-instance deployments sharing one cache

use async_trait::async_trait;
use ::redis::aio::ConnectionManager;
use ::redis::AsyncCommands;
use std::time::Duration;
use tracing::info;

use super::{BackendError, CacheBackend};

pub struct RedisBackend {
    manager: ConnectionManager,
}

impl RedisBackend {
    /// Connect and keep a reconnecting connection manager
    pub async fn connect(url: &str) -> Result<Self, BackendError> {
        let client = ::redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        info!("Redis cache backend connected");
        Ok(Self { manager })
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    fn name(&self) -> &str {
        "redis"
    }

    async fn read(&self, key: &str) -> Result<Option<String>, BackendError> {
        let mut conn = self.manager.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn write(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BackendError> {
        let mut conn = self.manager.clone();
        let millis = (ttl.as_millis() as u64).max(1);
        conn.pset_ex::<_, _, ()>(key, value, millis).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }
}
