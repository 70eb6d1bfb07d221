//! Application state shared across handlers

use crate::buffer::CallLogBuffer;
use crate::db::Database;
use crate::orchestrator::QueryOrchestrator;
use crate::redis_backend::RedisBackend;
use crate::routes::metrics::Metrics;
use std::sync::Arc;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool (absent when running on in-memory stores)
    pub db: Option<Arc<Database>>,
    /// Shared cache / governor backend, if configured and reachable
    pub redis: Option<RedisBackend>,
    /// Query pipeline
    pub orchestrator: Arc<QueryOrchestrator>,
    /// Lock-free call-log buffer drained by the flush task
    pub call_logs: CallLogBuffer,
    /// Application metrics for Prometheus
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(
        db: Option<Database>,
        redis: Option<RedisBackend>,
        orchestrator: QueryOrchestrator,
        call_logs: CallLogBuffer,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            db: db.map(Arc::new),
            redis,
            orchestrator: Arc::new(orchestrator),
            call_logs,
            metrics,
        }
    }
}
