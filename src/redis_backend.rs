//! Redis adapter shared by the distributed cache and the governor tables.

use std::time::Duration;

use deadpool_redis::{Config, Connection, Pool, Runtime};
use redis::AsyncCommands;

use crate::error::SharedError;

/// Pooled, namespaced Redis connection.
#[derive(Clone)]
pub struct RedisBackend {
    pool: Pool,
    namespace: Option<String>,
}

impl RedisBackend {
    pub async fn new(
        url: &str,
        namespace: Option<String>,
        pool_size: usize,
    ) -> Result<Self, SharedError> {
        let config = Config::from_url(url);
        let pool = config
            .builder()
            .map_err(|e| SharedError::Connection(e.to_string()))?
            .max_size(pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| SharedError::Connection(e.to_string()))?;

        let backend = Self { pool, namespace };
        backend.ping().await?;
        Ok(backend)
    }

    pub fn key(&self, key: &str) -> String {
        match &self.namespace {
            Some(ns) => format!("{}:{}", ns, key),
            None => key.to_string(),
        }
    }

    async fn conn(&self) -> Result<Connection, SharedError> {
        self.pool
            .get()
            .await
            .map_err(|e| SharedError::Connection(e.to_string()))
    }

    pub async fn ping(&self) -> Result<(), SharedError> {
        let mut conn = self.conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut *conn)
            .await
            .map_err(|e| SharedError::Backend(e.to_string()))?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SharedError> {
        let mut conn = self.conn().await?;
        conn.get(self.key(key))
            .await
            .map_err(|e| SharedError::Backend(e.to_string()))
    }

    /// `SET key value PX ttl`
    pub async fn set_px(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), SharedError> {
        let mut conn = self.conn().await?;
        redis::cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async::<()>(&mut *conn)
            .await
            .map_err(|e| SharedError::Backend(e.to_string()))
    }

    /// `SET key value NX PX ttl`; true when the key was created.
    pub async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, SharedError> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut *conn)
            .await
            .map_err(|e| SharedError::Backend(e.to_string()))?;
        Ok(reply.is_some())
    }

    pub async fn incr(&self, key: &str) -> Result<i64, SharedError> {
        let mut conn = self.conn().await?;
        conn.incr(self.key(key), 1)
            .await
            .map_err(|e| SharedError::Backend(e.to_string()))
    }

    pub async fn decr(&self, key: &str) -> Result<i64, SharedError> {
        let mut conn = self.conn().await?;
        conn.decr(self.key(key), 1)
            .await
            .map_err(|e| SharedError::Backend(e.to_string()))
    }

    pub async fn pexpire(&self, key: &str, ttl: Duration) -> Result<(), SharedError> {
        let mut conn = self.conn().await?;
        conn.pexpire::<_, ()>(self.key(key), ttl.as_millis() as i64)
            .await
            .map_err(|e| SharedError::Backend(e.to_string()))
    }

    /// Remaining lifetime in milliseconds, or `None` when the key is missing or has no expiry.
    pub async fn pttl(&self, key: &str) -> Result<Option<u64>, SharedError> {
        let mut conn = self.conn().await?;
        let ttl: i64 = conn
            .pttl(self.key(key))
            .await
            .map_err(|e| SharedError::Backend(e.to_string()))?;
        Ok((ttl >= 0).then_some(ttl as u64))
    }

    pub async fn del(&self, key: &str) -> Result<(), SharedError> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(self.key(key))
            .await
            .map_err(|e| SharedError::Backend(e.to_string()))
    }
}

