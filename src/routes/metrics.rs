//! Prometheus metrics endpoint

use axum::response::IntoResponse;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::cache::CacheTier;

/// Internal counters for the query layer
#[derive(Default)]
pub struct Metrics {
    queries_total: AtomicU64,
    query_errors_total: AtomicU64,
    cache_hits_local: AtomicU64,
    cache_hits_shared: AtomicU64,
    cache_hits_persistent: AtomicU64,
    cache_misses_total: AtomicU64,
    live_calls_total: AtomicU64,
    retries_total: AtomicU64,
    provider_errors_total: AtomicU64,
    rate_limited_total: AtomicU64,
    circuit_rejections_total: AtomicU64,
    token_refreshes_total: AtomicU64,
    best_effort_failures_total: AtomicU64,
    call_logs_dropped_total: AtomicU64,
    governor_fallbacks_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_queries(&self) {
        self.queries_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_query_errors(&self) {
        self.query_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_hit(&self, tier: CacheTier) {
        let counter = match tier {
            CacheTier::Local => &self.cache_hits_local,
            CacheTier::Shared => &self.cache_hits_shared,
            CacheTier::Persistent => &self.cache_hits_persistent,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_miss(&self) {
        self.cache_misses_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_live_calls(&self) {
        self.live_calls_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_retries(&self) {
        self.retries_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_provider_errors(&self) {
        self.provider_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rate_limited(&self) {
        self.rate_limited_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_circuit_rejections(&self) {
        self.circuit_rejections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_token_refreshes(&self) {
        self.token_refreshes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_best_effort_failures(&self) {
        self.best_effort_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_call_logs_dropped(&self, count: u64) {
        self.call_logs_dropped_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_governor_fallbacks(&self) {
        self.governor_fallbacks_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            queries_total: self.queries_total.load(Ordering::Relaxed),
            query_errors_total: self.query_errors_total.load(Ordering::Relaxed),
            cache_hits_local: self.cache_hits_local.load(Ordering::Relaxed),
            cache_hits_shared: self.cache_hits_shared.load(Ordering::Relaxed),
            cache_hits_persistent: self.cache_hits_persistent.load(Ordering::Relaxed),
            cache_misses_total: self.cache_misses_total.load(Ordering::Relaxed),
            live_calls_total: self.live_calls_total.load(Ordering::Relaxed),
            retries_total: self.retries_total.load(Ordering::Relaxed),
            provider_errors_total: self.provider_errors_total.load(Ordering::Relaxed),
            rate_limited_total: self.rate_limited_total.load(Ordering::Relaxed),
            circuit_rejections_total: self.circuit_rejections_total.load(Ordering::Relaxed),
            token_refreshes_total: self.token_refreshes_total.load(Ordering::Relaxed),
            best_effort_failures_total: self.best_effort_failures_total.load(Ordering::Relaxed),
            call_logs_dropped_total: self.call_logs_dropped_total.load(Ordering::Relaxed),
            governor_fallbacks_total: self.governor_fallbacks_total.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
pub struct MetricsSnapshot {
    pub queries_total: u64,
    pub query_errors_total: u64,
    pub cache_hits_local: u64,
    pub cache_hits_shared: u64,
    pub cache_hits_persistent: u64,
    pub cache_misses_total: u64,
    pub live_calls_total: u64,
    pub retries_total: u64,
    pub provider_errors_total: u64,
    pub rate_limited_total: u64,
    pub circuit_rejections_total: u64,
    pub token_refreshes_total: u64,
    pub best_effort_failures_total: u64,
    pub call_logs_dropped_total: u64,
    pub governor_fallbacks_total: u64,
}

/// GET /metrics
///
/// Returns Prometheus-format metrics
pub async fn prometheus_metrics(
    axum::extract::State(state): axum::extract::State<crate::state::AppState>,
) -> impl IntoResponse {
    let s = state.metrics.get_metrics();
    let buffer_len = state.call_logs.len() as u64;

    let output = format!(
        r#"# HELP analytics_relay_queries_total Queries received
# TYPE analytics_relay_queries_total counter
analytics_relay_queries_total {}

# HELP analytics_relay_query_errors_total Queries that ended in an error
# TYPE analytics_relay_query_errors_total counter
analytics_relay_query_errors_total {}

# HELP analytics_relay_cache_hits_total Cache hits by tier
# TYPE analytics_relay_cache_hits_total counter
analytics_relay_cache_hits_total{{tier="local"}} {}
analytics_relay_cache_hits_total{{tier="shared"}} {}
analytics_relay_cache_hits_total{{tier="persistent"}} {}

# HELP analytics_relay_cache_misses_total Lookups that missed every tier
# TYPE analytics_relay_cache_misses_total counter
analytics_relay_cache_misses_total {}

# HELP analytics_relay_live_calls_total Provider attempts dispatched
# TYPE analytics_relay_live_calls_total counter
analytics_relay_live_calls_total {}

# HELP analytics_relay_retries_total Provider attempts that were retries
# TYPE analytics_relay_retries_total counter
analytics_relay_retries_total {}

# HELP analytics_relay_provider_errors_total Provider calls that failed after retries
# TYPE analytics_relay_provider_errors_total counter
analytics_relay_provider_errors_total {}

# HELP analytics_relay_rate_limited_total Calls rejected by the caller rate limit
# TYPE analytics_relay_rate_limited_total counter
analytics_relay_rate_limited_total {}

# HELP analytics_relay_circuit_rejections_total Calls rejected by an open circuit
# TYPE analytics_relay_circuit_rejections_total counter
analytics_relay_circuit_rejections_total {}

# HELP analytics_relay_token_refreshes_total OAuth refresh calls made
# TYPE analytics_relay_token_refreshes_total counter
analytics_relay_token_refreshes_total {}

# HELP analytics_relay_best_effort_failures_total Swallowed cache or log write failures
# TYPE analytics_relay_best_effort_failures_total counter
analytics_relay_best_effort_failures_total {}

# HELP analytics_relay_call_logs_dropped_total Call logs dropped because the buffer was full
# TYPE analytics_relay_call_logs_dropped_total counter
analytics_relay_call_logs_dropped_total {}

# HELP analytics_relay_governor_fallbacks_total Governor operations served by the in-process fallback
# TYPE analytics_relay_governor_fallbacks_total counter
analytics_relay_governor_fallbacks_total {}

# HELP analytics_relay_call_log_buffer_depth Call logs waiting to be flushed
# TYPE analytics_relay_call_log_buffer_depth gauge
analytics_relay_call_log_buffer_depth {}

# HELP analytics_relay_info Build information
# TYPE analytics_relay_info gauge
analytics_relay_info{{version="{}"}} 1
"#,
        s.queries_total,
        s.query_errors_total,
        s.cache_hits_local,
        s.cache_hits_shared,
        s.cache_hits_persistent,
        s.cache_misses_total,
        s.live_calls_total,
        s.retries_total,
        s.provider_errors_total,
        s.rate_limited_total,
        s.circuit_rejections_total,
        s.token_refreshes_total,
        s.best_effort_failures_total,
        s.call_logs_dropped_total,
        s.governor_fallbacks_total,
        buffer_len,
        env!("CARGO_PKG_VERSION"),
    );

    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        output,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_hits_are_counted_per_tier() {
        let metrics = Metrics::new();
        metrics.inc_cache_hit(CacheTier::Local);
        metrics.inc_cache_hit(CacheTier::Local);
        metrics.inc_cache_hit(CacheTier::Persistent);
        metrics.inc_call_logs_dropped(3);

        let s = metrics.get_metrics();
        assert_eq!(s.cache_hits_local, 2);
        assert_eq!(s.cache_hits_shared, 0);
        assert_eq!(s.cache_hits_persistent, 1);
        assert_eq!(s.call_logs_dropped_total, 3);
    }
}
