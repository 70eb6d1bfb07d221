//! Resource governor: per-property concurrency and per-caller rate limits.
//!
//! Both tables live in Redis when it is configured so limits hold across
//! instances; any Redis failure falls back to the in-process table.

pub mod concurrency;
pub mod rate_limit;

use std::sync::Arc;

pub use concurrency::{ConcurrencyLimiter, LocalSlots, RedisSlots, SlotTable};
pub use rate_limit::{LocalWindows, RateLimiter, RedisWindows, WindowCount, WindowTable};

use crate::config::GovernorConfig;
use crate::redis_backend::RedisBackend;
use crate::routes::metrics::Metrics;

pub struct Governor {
    pub concurrency: ConcurrencyLimiter,
    pub rate: RateLimiter,
}

impl Governor {
    pub fn new(config: &GovernorConfig, redis: Option<RedisBackend>, metrics: Arc<Metrics>) -> Self {
        let local = Arc::new(LocalSlots::new(config.concurrency_per_property));
        let (slots, windows): (Option<Arc<dyn SlotTable>>, Option<Arc<dyn WindowTable>>) =
            match redis {
                Some(redis) => (
                    Some(Arc::new(RedisSlots::new(
                        redis.clone(),
                        config.concurrency_per_property,
                        config.concurrency_poll,
                        config.concurrency_slot_ttl,
                    ))),
                    Some(Arc::new(RedisWindows::new(redis))),
                ),
                None => (None, None),
            };

        Self {
            concurrency: ConcurrencyLimiter::new(slots, local, metrics.clone()),
            rate: RateLimiter::new(
                windows,
                config.rate_limit_max,
                config.rate_limit_window,
                metrics,
            ),
        }
    }
}

/// Concurrency slot key for one external resource.
pub fn property_key(property_id: &str) -> String {
    format!("gov:conc:{}", property_id)
}

/// Rate limit key for one caller against one property.
pub fn caller_key(tenant_id: &str, user_id: &str, property_id: &str) -> String {
    format!("gov:rate:{}:{}:{}", tenant_id, user_id, property_id)
}
