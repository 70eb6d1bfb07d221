//! Tiered result cache.
//!
//! Read order is in-process map, then the distributed cache, then the
//! persistent store. A live fetch writes every layer. Layers agree because
//! the key is a pure function of the normalized request.

pub mod shared;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::models::{CacheEntry, CacheEntryKey};
use crate::routes::metrics::Metrics;
use crate::store::ResultStore;

pub use shared::{MemorySharedCache, SharedCache};

/// Which layer answered a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Local,
    Shared,
    Persistent,
}

#[derive(Debug, Clone)]
struct LocalEntry {
    value: Value,
    expires_at: Instant,
}

/// In-process map plus the optional distributed cache.
pub struct TieredCache {
    local: RwLock<HashMap<String, LocalEntry>>,
    local_max_entries: usize,
    shared: Option<Arc<dyn SharedCache>>,
    shared_max_ttl: Duration,
    metrics: Arc<Metrics>,
}

impl TieredCache {
    pub fn new(
        config: &CacheConfig,
        shared: Option<Arc<dyn SharedCache>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            local: RwLock::new(HashMap::new()),
            local_max_entries: config.l1_max_entries.max(1),
            shared,
            shared_max_ttl: Duration::from_millis(config.shared_max_ttl_ms.max(1) as u64),
            metrics,
        }
    }

    /// L1 first, then the distributed cache. A shared hit is copied into L1.
    pub async fn get(&self, key: &str) -> Option<(Value, CacheTier)> {
        if let Some(value) = self.get_local(key) {
            return Some((value, CacheTier::Local));
        }

        let shared = self.shared.as_ref()?;
        let bytes = match shared.get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, key, "Shared cache read failed");
                self.metrics.inc_best_effort_failures();
                return None;
            }
        };

        match serde_json::from_slice::<Value>(&bytes) {
            Ok(value) => {
                self.put_local(key, value.clone(), self.shared_max_ttl);
                Some((value, CacheTier::Shared))
            }
            Err(e) => {
                warn!(error = %e, key, "Discarding undecodable shared cache entry");
                None
            }
        }
    }

    /// Write L1 and, best-effort, the distributed cache. `ttl_ms <= 0` stores nothing.
    pub async fn set(&self, key: &str, value: &Value, ttl_ms: i64) {
        if ttl_ms <= 0 {
            return;
        }
        let ttl = Duration::from_millis(ttl_ms as u64);
        self.put_local(key, value.clone(), ttl);

        if let Some(shared) = &self.shared {
            let bytes = match serde_json::to_vec(value) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, key, "Failed to encode cache value");
                    return;
                }
            };
            if let Err(e) = shared.set(key, &bytes, ttl.min(self.shared_max_ttl)).await {
                warn!(error = %e, key, "Shared cache write failed");
                self.metrics.inc_best_effort_failures();
            }
        }
    }

    fn get_local(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        {
            let local = self.local.read();
            match local.get(key) {
                Some(entry) if entry.expires_at > now => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        self.local.write().remove(key);
        None
    }

    fn put_local(&self, key: &str, value: Value, ttl: Duration) {
        let now = Instant::now();
        let mut local = self.local.write();
        if local.len() >= self.local_max_entries && !local.contains_key(key) {
            local.retain(|_, e| e.expires_at > now);
            if local.len() >= self.local_max_entries {
                let oldest = local
                    .iter()
                    .min_by_key(|(_, e)| e.expires_at)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    local.remove(&oldest);
                }
            }
        }
        local.insert(
            key.to_string(),
            LocalEntry {
                value,
                expires_at: now + ttl,
            },
        );
    }

    pub fn local_len(&self) -> usize {
        self.local.read().len()
    }
}

/// Full identity of a cached result.
#[derive(Debug, Clone)]
pub struct CacheKey {
    pub entry: CacheEntryKey,
    pub ttl_ms: i64,
}

impl CacheKey {
    /// Key used for the in-process and distributed layers.
    pub fn as_string(&self) -> String {
        format!(
            "q:{}:{}:{}:{}",
            self.entry.tenant_id,
            self.entry.property_id,
            self.entry.kind.as_str(),
            self.entry.request_hash
        )
    }
}

/// The three layers, consulted and written as one.
pub struct ResultCache {
    tiered: TieredCache,
    store: Arc<dyn ResultStore>,
    metrics: Arc<Metrics>,
}

impl ResultCache {
    pub fn new(tiered: TieredCache, store: Arc<dyn ResultStore>, metrics: Arc<Metrics>) -> Self {
        Self {
            tiered,
            store,
            metrics,
        }
    }

    pub fn tiered(&self) -> &TieredCache {
        &self.tiered
    }

    /// Look up every layer. A persistent hit re-populates the faster layers.
    pub async fn lookup(&self, key: &CacheKey) -> Option<(Value, CacheTier)> {
        if key.ttl_ms <= 0 {
            return None;
        }
        let cache_key = key.as_string();
        if let Some(hit) = self.tiered.get(&cache_key).await {
            self.metrics.inc_cache_hit(hit.1);
            return Some(hit);
        }

        let entry = match self.store.find_entry(&key.entry).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                self.metrics.inc_cache_miss();
                return None;
            }
            Err(e) => {
                warn!(error = %e, key = %cache_key, "Persistent cache read failed");
                self.metrics.inc_best_effort_failures();
                self.metrics.inc_cache_miss();
                return None;
            }
        };

        let now = Utc::now();
        if entry.is_expired(now) {
            debug!(key = %cache_key, "Persistent cache entry expired");
            self.metrics.inc_cache_miss();
            return None;
        }

        let remaining_ms = (entry.expires_at - now).num_milliseconds();
        self.tiered.set(&cache_key, &entry.response, remaining_ms).await;
        self.metrics.inc_cache_hit(CacheTier::Persistent);
        Some((entry.response, CacheTier::Persistent))
    }

    /// Write every layer after a live fetch. Failures are logged, never returned.
    pub async fn store(&self, key: &CacheKey, request: &Value, response: &Value) {
        if key.ttl_ms <= 0 {
            return;
        }
        let cache_key = key.as_string();
        let entry = CacheEntry {
            key: key.entry.clone(),
            request: request.clone(),
            response: response.clone(),
            expires_at: expires_at(Utc::now(), key.ttl_ms),
        };
        if let Err(e) = self.store.upsert_entry(&entry).await {
            warn!(error = %e, key = %cache_key, "Persistent cache write failed");
            self.metrics.inc_best_effort_failures();
        }
        self.tiered.set(&cache_key, response, key.ttl_ms).await;
    }
}

fn expires_at(now: DateTime<Utc>, ttl_ms: i64) -> DateTime<Utc> {
    now + chrono::Duration::milliseconds(ttl_ms)
}
