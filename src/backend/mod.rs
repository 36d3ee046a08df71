//! Durable Cache Backends
//!
//! TTL-aware key/value stores that extend the [`AdaptiveCache`](crate::cache::AdaptiveCache)
//! beyond process memory. Every backend is fully substitutable by
//! [`MemoryBackend`].

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub mod memory;
pub mod redis;
pub mod sqlite;

pub use self::memory::MemoryBackend;
pub use self::redis::RedisBackend;
pub use self::sqlite::SqliteBackend;

use crate::config::BackendConfig;

/// Backend operation failures
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Backend I/O failed: {0}")]
    Io(String),
}

impl From<rusqlite::Error> for BackendError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<::redis::RedisError> for BackendError {
    fn from(e: ::redis::RedisError) -> Self {
        if e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
            Self::Unavailable(e.to_string())
        } else {
            Self::Io(e.to_string())
        }
    }
}

/// Key/value store with per-entry expiry
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &str;

    /// Read a value; expired entries read as `None`
    async fn read(&self, key: &str) -> Result<Option<String>, BackendError>;

    /// Write a value that expires after `ttl`
    async fn write(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BackendError>;

    /// Remove a value
    async fn delete(&self, key: &str) -> Result<(), BackendError>;

    /// Physically remove expired entries. Stores with native expiry keep the default.
    async fn purge_expired(&self) -> Result<usize, BackendError> {
        Ok(0)
    }
}

/// Run `purge_expired` every `interval` until cancelled
pub fn spawn_purger(
    backend: Arc<dyn CacheBackend>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = backend.purge_expired().await {
                        warn!("Cache backend '{}' purge failed: {}", backend.name(), e);
                    }
                }
                _ = shutdown.cancelled() => {
                    debug!("Cache backend purger [{}] stopped", backend.name());
                    break;
                }
            }
        }
    })
}

/// Build the configured backend, if any
pub async fn from_config(config: &BackendConfig) -> anyhow::Result<Option<Arc<dyn CacheBackend>>> {
    match config {
        BackendConfig::None => Ok(None),
        BackendConfig::Memory => Ok(Some(Arc::new(MemoryBackend::new()))),
        BackendConfig::Sqlite { path } => Ok(Some(Arc::new(SqliteBackend::open(path)?))),
        BackendConfig::Redis { url } => Ok(Some(Arc::new(RedisBackend::connect(url).await?))),
    }
}
