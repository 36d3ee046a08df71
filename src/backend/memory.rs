//! In-process backend, used in tests and when no durable store is configured

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::{BackendError, CacheBackend};

#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn read(&self, key: &str) -> Result<Option<String>, BackendError> {
        let mut entries = self.entries.lock();
        let live = match entries.get(key) {
            Some((value, expires_at)) if Instant::now() < *expires_at => Some(value.clone()),
            Some(_) => None,
            None => return Ok(None),
        };
        if live.is_none() {
            entries.remove(key);
        }
        Ok(live)
    }

    async fn write(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BackendError> {
        self.entries
            .lock()
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, BackendError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, (_, expires_at)| now < *expires_at);
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_memory_backend_expiry() {
        let backend = MemoryBackend::new();
        backend.write("k", "v", Duration::from_secs(10)).await.unwrap();
        assert_eq!(backend.read("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(backend.read("k").await.unwrap().is_none());
        assert!(backend.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_backend_purge() {
        let backend = MemoryBackend::new();
        backend.write("short", "v", Duration::from_secs(1)).await.unwrap();
        backend.write("long", "v", Duration::from_secs(60)).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(backend.purge_expired().await.unwrap(), 1);
        assert_eq!(backend.len(), 1);
    }
}
