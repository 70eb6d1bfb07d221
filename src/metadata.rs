//! Field-name validation against a property's metadata schema.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use serde_json::json;
use tracing::warn;

use crate::cache::{CacheKey, ResultCache};
use crate::error::{QueryError, Result};
use crate::hash::stable_hash;
use crate::models::{CacheEntryKey, FieldRefs, MetadataSchema, QueryKind};

pub struct MetadataValidator {
    cache: Arc<ResultCache>,
    ttl_ms: i64,
}

impl MetadataValidator {
    pub fn new(cache: Arc<ResultCache>, ttl_ms: i64) -> Self {
        Self { cache, ttl_ms }
    }

    pub fn cache_key(&self, tenant_id: &str, property_id: &str) -> Result<CacheKey> {
        let request_hash = stable_hash(&json!({
            "kind": QueryKind::Metadata,
            "tenantId": tenant_id,
            "propertyId": property_id,
        }))?;
        Ok(CacheKey {
            entry: CacheEntryKey {
                tenant_id: tenant_id.to_string(),
                property_id: property_id.to_string(),
                kind: QueryKind::Metadata,
                request_hash,
            },
            ttl_ms: self.ttl_ms,
        })
    }

    /// Cached schema for the property, calling `fetch` on a miss.
    /// The bool is true when the schema came from a cache layer.
    pub async fn schema<F, Fut>(
        &self,
        tenant_id: &str,
        property_id: &str,
        fetch: F,
    ) -> Result<(MetadataSchema, bool)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<MetadataSchema>>,
    {
        let key = self.cache_key(tenant_id, property_id)?;
        if let Some((value, _)) = self.cache.lookup(&key).await {
            match serde_json::from_value(value) {
                Ok(schema) => return Ok((schema, true)),
                Err(e) => warn!(error = %e, property_id, "Discarding unreadable cached metadata"),
            }
        }

        let schema = fetch().await?;
        let response = serde_json::to_value(&schema)?;
        let request = json!({ "kind": QueryKind::Metadata, "propertyId": property_id });
        self.cache.store(&key, &request, &response).await;
        Ok((schema, false))
    }

    /// Fetch (or reuse) the schema and check every referenced field against
    /// it. `refs` holds one entry per request sharing the property (a batch
    /// has several); invalid fields from all of them are reported together.
    pub async fn validate<F, Fut>(
        &self,
        tenant_id: &str,
        property_id: &str,
        refs: &[FieldRefs<'_>],
        fetch: F,
    ) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<MetadataSchema>>,
    {
        if refs.is_empty() {
            return Ok(());
        }
        let (schema, _) = self.schema(tenant_id, property_id, fetch).await?;
        check_fields(&schema, refs)
    }
}

/// Every unknown or misplaced field across `refs`, reported together.
pub fn check_fields(schema: &MetadataSchema, refs: &[FieldRefs<'_>]) -> Result<()> {
    let mut invalid = BTreeSet::new();
    for r in refs {
        collect_invalid(schema, r, &mut invalid);
    }

    if invalid.is_empty() {
        return Ok(());
    }
    let invalid_fields: Vec<String> = invalid.into_iter().collect();
    Err(QueryError::Validation {
        message: format!("Unknown or invalid fields: {}", invalid_fields.join(", ")),
        invalid_fields,
    })
}

fn collect_invalid(schema: &MetadataSchema, refs: &FieldRefs<'_>, invalid: &mut BTreeSet<String>) {
    for metric in refs.metrics {
        if !schema.metrics.contains(metric) {
            invalid.insert(metric.clone());
        }
    }
    for dimension in refs.dimensions {
        if !schema.dimensions.contains(dimension) {
            invalid.insert(dimension.clone());
        }
    }
    if let Some(filter) = refs.dimension_filter {
        for name in filter.field_names() {
            if !schema.dimensions.contains(name) {
                invalid.insert(name.to_string());
            }
        }
    }
    if let Some(filter) = refs.metric_filter {
        for name in filter.field_names() {
            if !schema.metrics.contains(name) {
                invalid.insert(name.to_string());
            }
        }
    }
    // ordering is only meaningful on a field the request actually selects
    for order in refs.order_bys {
        if let Some(metric) = &order.metric {
            let name = &metric.metric_name;
            if !schema.metrics.contains(name) || !refs.metrics.contains(name) {
                invalid.insert(name.clone());
            }
        }
        if let Some(dimension) = &order.dimension {
            let name = &dimension.dimension_name;
            if !schema.dimensions.contains(name) || !refs.dimensions.contains(name) {
                invalid.insert(name.clone());
            }
        }
    }
}
