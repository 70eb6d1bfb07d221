//! Distributed cache seam: `GET` / `SET key value ttl`, nothing more.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::time::Instant;

use crate::error::SharedError;
use crate::redis_backend::RedisBackend;

#[async_trait]
pub trait SharedCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SharedError>;

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), SharedError>;
}

#[async_trait]
impl SharedCache for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SharedError> {
        RedisBackend::get(self, key).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), SharedError> {
        self.set_px(key, value, ttl).await
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// Process-local stand-in for the distributed cache.
#[derive(Debug, Clone, Default)]
pub struct MemorySharedCache {
    data: Arc<RwLock<HashMap<String, Entry>>>,
}

impl MemorySharedCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data
            .read()
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SharedCache for MemorySharedCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SharedError> {
        let now = Instant::now();
        {
            let data = self.data.read();
            match data.get(key) {
                Some(entry) if entry.expires_at > now => return Ok(Some(entry.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        self.data.write().remove(key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), SharedError> {
        self.data.write().insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }
}
