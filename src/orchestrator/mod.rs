//! Query orchestrator: the single entry point for running an analytics query.
//!
//! Normalization happens here; everything after it is delegated to a
//! [`QueryStrategy`] chosen once at construction. [`LiveStrategy`] runs the
//! full cache/governor/credential/provider pipeline, [`MockStrategy`]
//! synthesizes deterministic data for local environments.

pub mod live;
pub mod mock;
pub mod report;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};

pub use live::LiveStrategy;
pub use mock::MockStrategy;

use crate::cache::CacheKey;
use crate::config::CacheConfig;
use crate::error::{QueryError, Result};
use crate::hash::stable_hash;
use crate::models::{CacheEntryKey, NormalizedPayload, NormalizedRequest, QueryResponse, RunQuery};
use crate::normalize::Normalizer;
use crate::routes::metrics::Metrics;

/// What happens to a query once it has been normalized.
#[async_trait]
pub trait QueryStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, input: &RunQuery, request: &NormalizedRequest)
        -> Result<QueryResponse>;
}

pub struct QueryOrchestrator {
    normalizer: Normalizer,
    strategy: Arc<dyn QueryStrategy>,
    metrics: Arc<Metrics>,
}

impl QueryOrchestrator {
    pub fn new(normalizer: Normalizer, strategy: Arc<dyn QueryStrategy>, metrics: Arc<Metrics>) -> Self {
        info!(strategy = strategy.name(), "Query orchestrator ready");
        Self {
            normalizer,
            strategy,
            metrics,
        }
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Run one query end to end.
    pub async fn run_query(&self, input: &RunQuery) -> Result<QueryResponse> {
        self.metrics.inc_queries();

        let result = match self.normalizer.normalize(input) {
            Ok(request) => self.strategy.execute(input, &request).await,
            Err(e) => Err(e),
        };

        match &result {
            Ok(response) => debug!(
                tenant_id = %input.tenant_id,
                property_id = %input.property_id,
                kind = input.kind.as_str(),
                request_hash = %response.request_hash,
                cached = response.cached,
                "Query served"
            ),
            Err(e) => {
                self.metrics.inc_query_errors();
                log_failure(input, e);
            }
        }
        result
    }
}

fn log_failure(input: &RunQuery, error: &QueryError) {
    match error {
        QueryError::Internal(_) | QueryError::Provider { .. } | QueryError::Timeout { .. } => {
            warn!(
                tenant_id = %input.tenant_id,
                property_id = %input.property_id,
                kind = input.kind.as_str(),
                code = error.code(),
                error = %error,
                "Query failed"
            )
        }
        _ => info!(
            tenant_id = %input.tenant_id,
            property_id = %input.property_id,
            kind = input.kind.as_str(),
            code = error.code(),
            error = %error,
            "Query rejected"
        ),
    }
}

/// Cache lifetime for this request: the caller's override, else the per-kind
/// default. A compatibility check that names no metric is never stored.
pub fn effective_ttl(config: &CacheConfig, input: &RunQuery, request: &NormalizedRequest) -> i64 {
    if let NormalizedPayload::Compatibility(payload) = &request.payload {
        if payload.metrics.is_empty() {
            return 0;
        }
    }
    input
        .cache_ttl_ms_override
        .unwrap_or_else(|| config.ttl_for(request.kind))
}

/// Cache identity of a normalized request. The lifetime is part of the hash
/// so entries written under different TTL policies never alias.
pub fn cache_key(tenant_id: &str, request: &NormalizedRequest, ttl_ms: i64) -> Result<CacheKey> {
    let request_hash = stable_hash(&json!({
        "kind": request.kind,
        "tenantId": tenant_id,
        "propertyId": request.property_id,
        "request": request,
        "ttlMs": ttl_ms,
    }))?;
    Ok(CacheKey {
        entry: CacheEntryKey {
            tenant_id: tenant_id.to_string(),
            property_id: request.property_id.clone(),
            kind: request.kind,
            request_hash,
        },
        ttl_ms,
    })
}

/// Circuit-breaker identity for provider calls against one property.
pub fn provider_resource(property_id: &str) -> String {
    format!("provider:{}", property_id)
}
