//! Live pipeline: selection check, metadata validation, tiered cache,
//! rate limit, concurrency slot, credentials, provider call, call log.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::report::finish_report;
use super::{cache_key, effective_ttl, provider_resource, QueryStrategy};
use crate::buffer::{cap_payload, CallLogBuffer};
use crate::cache::{CacheKey, ResultCache};
use crate::config::{CacheConfig, CallLogConfig, RequestLimits};
use crate::credentials::CredentialBroker;
use crate::error::{QueryError, Result};
use crate::governor::{caller_key, property_key, Governor};
use crate::metadata::MetadataValidator;
use crate::models::{
    BatchData, CallLogRecord, FieldRefs, MetadataSchema, NormalizedPayload, NormalizedRequest,
    PageMode, QueryKind, QueryResponse, ReportData, ReportPayload, ResponseBody, RunQuery,
};
use crate::provider::{self, AnalyticsProvider, ProviderError};
use crate::reliability::{Executor, ReliabilityError};

/// Everything the live pipeline talks to.
pub struct LiveStrategy {
    pub credentials: Arc<CredentialBroker>,
    pub validator: Arc<MetadataValidator>,
    pub cache: Arc<ResultCache>,
    pub governor: Arc<Governor>,
    pub executor: Arc<Executor>,
    pub provider: Arc<dyn AnalyticsProvider>,
    pub call_logs: CallLogBuffer,
    pub cache_config: CacheConfig,
    pub limits: RequestLimits,
    pub call_log_config: CallLogConfig,
}

/// Identity of the provider calls made for one query, for call logging.
struct CallContext<'a> {
    tenant_id: &'a str,
    property_id: &'a str,
    kind: QueryKind,
    request_hash: &'a str,
    request: Value,
}

#[async_trait]
impl QueryStrategy for LiveStrategy {
    fn name(&self) -> &'static str {
        "live"
    }

    async fn execute(&self, input: &RunQuery, request: &NormalizedRequest) -> Result<QueryResponse> {
        let tenant_id = input.tenant_id.as_str();
        let property_id = request.property_id.as_str();

        if !input.skip_selection_check {
            self.check_selection(tenant_id, property_id).await?;
        }

        let refs = field_refs(&request.payload);
        self.validator
            .validate(tenant_id, property_id, &refs, || {
                self.fetch_metadata(tenant_id, property_id)
            })
            .await?;

        let key = match request.kind {
            // shares its entry with the validator's schema cache
            QueryKind::Metadata => self.validator.cache_key(tenant_id, property_id)?,
            _ => cache_key(
                tenant_id,
                request,
                effective_ttl(&self.cache_config, input, request),
            )?,
        };

        if let Some((value, tier)) = self.cache.lookup(&key).await {
            match ResponseBody::from_data(request.kind, value) {
                Ok(body) => {
                    debug!(
                        tenant_id,
                        property_id,
                        request_hash = %key.entry.request_hash,
                        tier = ?tier,
                        "Cache hit"
                    );
                    return Ok(QueryResponse {
                        cached: true,
                        request_hash: key.entry.request_hash,
                        body,
                    });
                }
                Err(e) => warn!(error = %e, request_hash = %key.entry.request_hash, "Discarding unreadable cache entry"),
            }
        }

        if input.caller_key.is_some() {
            self.governor
                .rate
                .assert_within_limit(&caller_key(tenant_id, &input.user_id, property_id))
                .await?;
        }

        let ctx = CallContext {
            tenant_id,
            property_id,
            kind: request.kind,
            request_hash: &key.entry.request_hash,
            request: serde_json::to_value(request)?,
        };
        let body = self
            .governor
            .concurrency
            .with_limit(&property_key(property_id), self.fetch_live(&ctx, request))
            .await?;

        self.store(&key, &ctx.request, &body).await;

        Ok(QueryResponse {
            cached: false,
            request_hash: key.entry.request_hash.clone(),
            body,
        })
    }
}

impl LiveStrategy {
    async fn check_selection(&self, tenant_id: &str, property_id: &str) -> Result<()> {
        match self.credentials.selected_property(tenant_id).await? {
            Some(selected) if selected == property_id => Ok(()),
            _ => Err(QueryError::PropertyNotSelected {
                property_id: property_id.to_string(),
            }),
        }
    }

    async fn store(&self, key: &CacheKey, request: &Value, body: &ResponseBody) {
        match body.to_data() {
            Ok(response) => self.cache.store(key, request, &response).await,
            Err(e) => warn!(error = %e, request_hash = %key.entry.request_hash, "Failed to encode response for cache"),
        }
    }

    /// Schema fetch used on a metadata cache miss. Spends quota, so it goes
    /// through the same slot, credential and reliability path as a query.
    async fn fetch_metadata(&self, tenant_id: &str, property_id: &str) -> Result<MetadataSchema> {
        let key = self.validator.cache_key(tenant_id, property_id)?;
        let ctx = CallContext {
            tenant_id,
            property_id,
            kind: QueryKind::Metadata,
            request_hash: &key.entry.request_hash,
            request: serde_json::json!({ "kind": QueryKind::Metadata, "propertyId": property_id }),
        };
        self.governor
            .concurrency
            .with_limit(&property_key(property_id), async {
                let grant = self.credentials.get_access_token(tenant_id).await?;
                let token = grant.access_token.as_str();
                self.call_provider(&ctx, || self.provider.get_metadata(token, property_id))
                    .await
            })
            .await
    }

    async fn fetch_live(&self, ctx: &CallContext<'_>, request: &NormalizedRequest) -> Result<ResponseBody> {
        // credential failures surface here, before the circuit is consulted
        let grant = self.credentials.get_access_token(ctx.tenant_id).await?;
        let token = grant.access_token.as_str();
        let property_id = ctx.property_id;

        match &request.payload {
            NormalizedPayload::Report(report) => {
                let data = match request.page_mode {
                    PageMode::All => {
                        let max_rows = request.max_rows.unwrap_or(self.limits.max_total_rows);
                        self.fetch_all_pages(ctx, token, report, max_rows).await?
                    }
                    PageMode::One => {
                        self.call_provider(ctx, || self.provider.run_report(token, property_id, report))
                            .await?
                    }
                };
                Ok(ResponseBody::Report(finish_report(data, report.return_property_quota)))
            }
            NormalizedPayload::Realtime(realtime) => {
                let data = self
                    .call_provider(ctx, || {
                        self.provider.run_realtime_report(token, property_id, realtime)
                    })
                    .await?;
                Ok(ResponseBody::Realtime(finish_report(data, realtime.return_property_quota)))
            }
            NormalizedPayload::Compatibility(compat) => {
                let verdict = self
                    .call_provider(ctx, || self.provider.check_compatibility(token, property_id, compat))
                    .await?;
                Ok(ResponseBody::Compatibility(verdict))
            }
            NormalizedPayload::BatchReport(batch) => {
                let reports = self
                    .call_provider(ctx, || {
                        self.provider.batch_run_reports(token, property_id, &batch.requests)
                    })
                    .await?;
                let reports = reports
                    .into_iter()
                    .zip(batch.requests.iter())
                    .map(|(data, sub)| finish_report(data, sub.return_property_quota))
                    .collect();
                Ok(ResponseBody::BatchReport(BatchData { reports }))
            }
            NormalizedPayload::Metadata => {
                let schema = self
                    .call_provider(ctx, || self.provider.get_metadata(token, property_id))
                    .await?;
                Ok(ResponseBody::Metadata(schema))
            }
        }
    }

    /// Fetch consecutive pages until the provider runs dry, the declared row
    /// count is reached, or `max_rows` rows have been collected.
    async fn fetch_all_pages(
        &self,
        ctx: &CallContext<'_>,
        token: &str,
        report: &ReportPayload,
        max_rows: u64,
    ) -> Result<ReportData> {
        let page_size = report
            .limit
            .unwrap_or(self.limits.default_page_size)
            .max(1);
        let start = report.offset.unwrap_or(0);
        let mut offset = start;
        let mut merged: Option<ReportData> = None;
        let mut declared = 0;

        loop {
            let collected = merged.as_ref().map_or(0, |m| m.rows.len() as u64);
            let remaining = max_rows.saturating_sub(collected);
            if remaining == 0 {
                break;
            }

            let mut page_request = report.clone();
            page_request.limit = Some(page_size.min(remaining));
            page_request.offset = Some(offset);

            let page = self
                .call_provider(ctx, || {
                    self.provider
                        .run_report(token, ctx.property_id, &page_request)
                })
                .await?;

            let page_rows = page.rows.len() as u64;
            declared = page.row_count;
            offset += page_rows;
            debug!(
                property_id = ctx.property_id,
                page_rows,
                offset,
                declared,
                "Fetched report page"
            );

            match merged.as_mut() {
                Some(all) => all.rows.extend(page.rows),
                None => merged = Some(page),
            }

            if page_rows == 0 || offset >= declared {
                break;
            }
        }

        let mut data = merged.ok_or_else(|| QueryError::validation("maxRows must be positive"))?;
        let rows = data.rows.len() as u64;
        data.row_count = declared;
        data.truncated = rows >= max_rows && declared > start + rows;
        Ok(data)
    }

    /// One logical provider call through the reliability executor. Every
    /// attempt that gets an answer is logged; a call that ends in a timeout
    /// is logged once.
    async fn call_provider<T, F, Fut>(&self, ctx: &CallContext<'_>, call: F) -> Result<T>
    where
        T: Serialize,
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, ProviderError>>,
    {
        let resource = provider_resource(ctx.property_id);
        let outcome = self
            .executor
            .execute(&resource, provider::classify, |attempt| {
                let pending = call();
                async move {
                    let started = Instant::now();
                    let result = pending.await;
                    self.log_attempt(ctx, attempt, &result, started.elapsed());
                    result
                }
            })
            .await;

        outcome.map_err(|e| {
            if let ReliabilityError::Timeout { timeout_ms } = &e {
                self.log_call(
                    ctx,
                    None,
                    None,
                    Some(e.to_string()),
                    Duration::from_millis(*timeout_ms),
                );
            }
            QueryError::from(e)
        })
    }

    fn log_attempt<T: Serialize>(
        &self,
        ctx: &CallContext<'_>,
        attempt: u32,
        result: &std::result::Result<T, ProviderError>,
        elapsed: Duration,
    ) {
        debug!(
            property_id = ctx.property_id,
            kind = ctx.kind.as_str(),
            attempt,
            ok = result.is_ok(),
            duration_ms = elapsed.as_millis() as u64,
            "Provider attempt finished"
        );
        match result {
            Ok(value) => {
                let response = serde_json::to_value(value).ok().map(|v| {
                    cap_payload(v, self.call_log_config.max_bytes, self.call_log_config.max_rows)
                });
                self.log_call(ctx, response, Some(200), None, elapsed);
            }
            Err(e) => {
                let status = match e {
                    ProviderError::Http { status, .. } => Some(i32::from(*status)),
                    _ => None,
                };
                self.log_call(ctx, None, status, Some(e.to_string()), elapsed);
            }
        }
    }

    fn log_call(
        &self,
        ctx: &CallContext<'_>,
        response: Option<Value>,
        http_status: Option<i32>,
        error: Option<String>,
        elapsed: Duration,
    ) {
        self.call_logs.record(CallLogRecord {
            id: Uuid::new_v4(),
            tenant_id: ctx.tenant_id.to_string(),
            property_id: ctx.property_id.to_string(),
            kind: ctx.kind,
            request_hash: ctx.request_hash.to_string(),
            request: ctx.request.clone(),
            response,
            http_status,
            error,
            duration_ms: elapsed.as_millis() as u64,
            created_at: Utc::now(),
        });
    }
}

/// Field references to check against the schema, one entry per request
/// (batch payloads yield one per sub-request).
fn field_refs(payload: &NormalizedPayload) -> Vec<FieldRefs<'_>> {
    match payload {
        NormalizedPayload::Report(report) => vec![report_refs(report)],
        NormalizedPayload::Realtime(realtime) => vec![FieldRefs {
            metrics: &realtime.metrics,
            dimensions: &realtime.dimensions,
            dimension_filter: realtime.dimension_filter.as_ref(),
            metric_filter: realtime.metric_filter.as_ref(),
            order_bys: &realtime.order_bys,
        }],
        NormalizedPayload::Compatibility(compat) => vec![FieldRefs {
            metrics: &compat.metrics,
            dimensions: &compat.dimensions,
            dimension_filter: compat.dimension_filter.as_ref(),
            metric_filter: compat.metric_filter.as_ref(),
            order_bys: &[],
        }],
        NormalizedPayload::BatchReport(batch) => batch.requests.iter().map(report_refs).collect(),
        NormalizedPayload::Metadata => Vec::new(),
    }
}

fn report_refs(report: &ReportPayload) -> FieldRefs<'_> {
    FieldRefs {
        metrics: &report.metrics,
        dimensions: &report.dimensions,
        dimension_filter: report.dimension_filter.as_ref(),
        metric_filter: report.metric_filter.as_ref(),
        order_bys: &report.order_bys,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemorySharedCache, TieredCache};
    use crate::config::{CredentialConfig, GovernorConfig, ReliabilityConfig};
    use crate::credentials::{RefreshFailure, RefreshedToken, TokenCipher, TokenRefresher};
    use crate::models::{
        CompatibilityPayload, CompatibilityVerdict, CredentialRecord, CredentialStatus,
        MetricHeader, RealtimePayload, ReportRow,
    };
    use crate::normalize::Normalizer;
    use crate::orchestrator::QueryOrchestrator;
    use crate::routes::metrics::Metrics;
    use crate::store::{MemoryCredentialStore, MemoryResultStore};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PAGE_CAP: u64 = 100;

    /// Serves `total_rows` rows in pages of at most 100, counting calls.
    #[derive(Default)]
    struct FakeProvider {
        total_rows: u64,
        report_calls: AtomicUsize,
        metadata_calls: AtomicUsize,
        failures: Mutex<VecDeque<ProviderError>>,
    }

    impl FakeProvider {
        fn with_rows(total_rows: u64) -> Self {
            Self {
                total_rows,
                ..Default::default()
            }
        }

        fn fail_next(&self, error: ProviderError) {
            self.failures.lock().push_back(error);
        }

        fn report_calls(&self) -> usize {
            self.report_calls.load(Ordering::SeqCst)
        }

        fn page(&self, request: &ReportPayload) -> ReportData {
            let offset = request.offset.unwrap_or(0).min(self.total_rows);
            let take = request
                .limit
                .unwrap_or(PAGE_CAP)
                .min(PAGE_CAP)
                .min(self.total_rows - offset);
            ReportData {
                dimension_headers: request.dimensions.clone(),
                metric_headers: request
                    .metrics
                    .iter()
                    .map(|m| MetricHeader {
                        name: m.clone(),
                        metric_type: "TYPE_INTEGER".into(),
                    })
                    .collect(),
                rows: (offset..offset + take)
                    .map(|i| ReportRow {
                        dimension_values: vec![format!("d{}", i)],
                        metric_values: vec![(i % 10).to_string()],
                    })
                    .collect(),
                totals: vec![],
                row_count: self.total_rows,
                quota: Some(json!({"tokensPerHour": {"consumed": 1, "remaining": 39999}})),
                truncated: false,
            }
        }
    }

    #[async_trait]
    impl AnalyticsProvider for FakeProvider {
        async fn run_report(
            &self,
            _access_token: &str,
            _property_id: &str,
            request: &ReportPayload,
        ) -> std::result::Result<ReportData, ProviderError> {
            self.report_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(e) = self.failures.lock().pop_front() {
                return Err(e);
            }
            Ok(self.page(request))
        }

        async fn run_realtime_report(
            &self,
            _access_token: &str,
            _property_id: &str,
            request: &RealtimePayload,
        ) -> std::result::Result<ReportData, ProviderError> {
            self.report_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.page(&ReportPayload {
                metrics: request.metrics.clone(),
                dimensions: request.dimensions.clone(),
                limit: Some(1),
                ..Default::default()
            }))
        }

        async fn batch_run_reports(
            &self,
            _access_token: &str,
            _property_id: &str,
            requests: &[ReportPayload],
        ) -> std::result::Result<Vec<ReportData>, ProviderError> {
            self.report_calls.fetch_add(1, Ordering::SeqCst);
            Ok(requests.iter().map(|r| self.page(r)).collect())
        }

        async fn check_compatibility(
            &self,
            _access_token: &str,
            _property_id: &str,
            _request: &CompatibilityPayload,
        ) -> std::result::Result<CompatibilityVerdict, ProviderError> {
            self.report_calls.fetch_add(1, Ordering::SeqCst);
            Ok(CompatibilityVerdict {
                compatible: false,
                incompatible_metrics: vec![],
                incompatible_dimensions: vec!["country".into()],
            })
        }

        async fn get_metadata(
            &self,
            _access_token: &str,
            _property_id: &str,
        ) -> std::result::Result<MetadataSchema, ProviderError> {
            self.metadata_calls.fetch_add(1, Ordering::SeqCst);
            Ok(schema())
        }
    }

    struct FakeRefresher {
        calls: AtomicUsize,
        outcome: std::result::Result<RefreshedToken, RefreshFailure>,
    }

    #[async_trait]
    impl TokenRefresher for FakeRefresher {
        async fn refresh(
            &self,
            _refresh_token: &str,
        ) -> std::result::Result<RefreshedToken, RefreshFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    fn schema() -> MetadataSchema {
        MetadataSchema {
            metrics: ["activeUsers", "sessions"].iter().map(|s| s.to_string()).collect(),
            dimensions: ["country", "date"].iter().map(|s| s.to_string()).collect(),
        }
    }

    struct Harness {
        orchestrator: QueryOrchestrator,
        provider: Arc<FakeProvider>,
        refresher: Arc<FakeRefresher>,
        credentials: MemoryCredentialStore,
        results: MemoryResultStore,
        shared: MemorySharedCache,
        call_logs: CallLogBuffer,
        validator: Arc<MetadataValidator>,
        executor: Arc<Executor>,
    }

    struct Setup {
        provider: FakeProvider,
        refresh: std::result::Result<RefreshedToken, RefreshFailure>,
        token_expires_in: chrono::Duration,
        governor: GovernorConfig,
    }

    impl Default for Setup {
        fn default() -> Self {
            Self {
                provider: FakeProvider::with_rows(7),
                refresh: Ok(RefreshedToken {
                    access_token: "fresh-token".into(),
                    refresh_token: None,
                    expires_in: Duration::from_secs(3600),
                }),
                token_expires_in: chrono::Duration::hours(1),
                governor: GovernorConfig::default(),
            }
        }
    }

    fn harness(setup: Setup) -> Harness {
        let metrics = Arc::new(Metrics::new());
        let cipher = TokenCipher::ephemeral();

        let credentials = MemoryCredentialStore::new();
        credentials.insert(CredentialRecord {
            tenant_id: "t1".into(),
            status: CredentialStatus::Connected,
            access_token_enc: Some(cipher.encrypt("stored-token").unwrap()),
            refresh_token_enc: Some(cipher.encrypt("refresh-token").unwrap()),
            expires_at: Some(Utc::now() + setup.token_expires_in),
            selected_property_id: Some("123".into()),
            last_error: None,
            updated_at: Utc::now(),
        });
        let refresher = Arc::new(FakeRefresher {
            calls: AtomicUsize::new(0),
            outcome: setup.refresh,
        });
        let broker = Arc::new(CredentialBroker::new(
            &CredentialConfig::default(),
            Arc::new(credentials.clone()),
            cipher,
            refresher.clone(),
            metrics.clone(),
        ));

        let cache_config = CacheConfig::default();
        let results = MemoryResultStore::new();
        let shared = MemorySharedCache::new();
        let cache = Arc::new(ResultCache::new(
            TieredCache::new(&cache_config, Some(Arc::new(shared.clone())), metrics.clone()),
            Arc::new(results.clone()),
            metrics.clone(),
        ));
        let validator = Arc::new(MetadataValidator::new(cache.clone(), cache_config.metadata_ttl_ms));

        let executor = Arc::new(Executor::new(
            ReliabilityConfig {
                timeout: Duration::from_secs(5),
                base_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
                jitter: Duration::ZERO,
                ..Default::default()
            },
            None,
            metrics.clone(),
        ));

        let call_logs = CallLogBuffer::new(1_000, metrics.clone());
        let provider = Arc::new(setup.provider);
        let limits = RequestLimits::default();
        let strategy = LiveStrategy {
            credentials: broker,
            validator: validator.clone(),
            cache,
            governor: Arc::new(Governor::new(&setup.governor, None, metrics.clone())),
            executor: executor.clone(),
            provider: provider.clone(),
            call_logs: call_logs.clone(),
            cache_config,
            limits: limits.clone(),
            call_log_config: CallLogConfig::default(),
        };

        Harness {
            orchestrator: QueryOrchestrator::new(Normalizer::new(limits), Arc::new(strategy), metrics),
            provider,
            refresher,
            credentials,
            results,
            shared,
            call_logs,
            validator,
            executor,
        }
    }

    impl Harness {
        async fn warm_schema(&self, property_id: &str) {
            self.validator
                .schema("t1", property_id, || async { Ok(schema()) })
                .await
                .unwrap();
        }

        async fn run(&self, input: serde_json::Value) -> Result<QueryResponse> {
            let mut base = json!({
                "tenantId": "t1",
                "userId": "u1",
                "propertyId": "123",
                "kind": "REPORT",
            });
            if let (Some(base), Some(extra)) = (base.as_object_mut(), input.as_object()) {
                base.extend(extra.clone());
            }
            let query: RunQuery = serde_json::from_value(base).unwrap();
            self.orchestrator.run_query(&query).await
        }
    }

    fn sessions_by_date() -> serde_json::Value {
        json!({
            "payload": {
                "metrics": ["sessions"],
                "dimensions": ["date"],
                "dateRanges": [{"startDate": "2024-01-01", "endDate": "2024-01-07"}]
            }
        })
    }

    fn http_error(status: u16) -> ProviderError {
        ProviderError::Http {
            status,
            reason: Some("INVALID_ARGUMENT".into()),
            message: "bad".into(),
            violations: vec!["dimensions[0]".into()],
        }
    }

    #[tokio::test]
    async fn second_identical_query_is_served_from_cache() {
        let h = harness(Setup::default());
        h.warm_schema("123").await;

        let first = h.run(sessions_by_date()).await.unwrap();
        let second = h.run(sessions_by_date()).await.unwrap();

        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(first.request_hash, second.request_hash);
        let (a, b) = (first.body.report().unwrap(), second.body.report().unwrap());
        assert_eq!(a.rows, b.rows);
        assert_eq!(a.totals, b.totals);
        assert_eq!(a.totals[0].dimension_values, vec!["RESERVED_TOTAL"]);
        assert!(a.quota.is_none());
        assert_eq!(h.provider.report_calls(), 1);
        assert_eq!(h.call_logs.len(), 1);
    }

    #[tokio::test]
    async fn unknown_metric_is_rejected_before_any_provider_call() {
        let h = harness(Setup::default());
        h.warm_schema("123").await;

        let err = h
            .run(json!({
                "payload": {
                    "metrics": ["sessions", "notAMetric"],
                    "dateRanges": [{"startDate": "2024-01-01", "endDate": "2024-01-07"}]
                }
            }))
            .await
            .unwrap_err();

        match err {
            QueryError::Validation { invalid_fields, .. } => {
                assert_eq!(invalid_fields, vec!["notAMetric".to_string()])
            }
            other => panic!("expected Validation, got {:?}", other),
        }
        assert_eq!(h.provider.report_calls(), 0);
        assert_eq!(h.provider.metadata_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn schema_is_fetched_once_on_first_use() {
        let h = harness(Setup::default());

        h.run(sessions_by_date()).await.unwrap();
        h.run(json!({
            "payload": {
                "metrics": ["activeUsers"],
                "dateRanges": [{"startDate": "7daysAgo", "endDate": "today"}]
            }
        }))
        .await
        .unwrap();

        assert_eq!(h.provider.metadata_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.provider.report_calls(), 2);
    }

    #[tokio::test]
    async fn deeply_nested_filter_fails_before_field_checks() {
        let h = harness(Setup::default());
        let mut filter = json!({
            "filter": {"fieldName": "notADimension", "stringFilter": {"value": "US"}}
        });
        for _ in 0..9 {
            filter = json!({ "andGroup": { "expressions": [filter] } });
        }

        let err = h
            .run(json!({
                "payload": {
                    "metrics": ["sessions"],
                    "dateRanges": [{"startDate": "2024-01-01", "endDate": "2024-01-07"}],
                    "dimensionFilter": filter
                }
            }))
            .await
            .unwrap_err();

        assert_eq!(err.code(), "FILTER_TOO_COMPLEX");
        assert_eq!(h.provider.metadata_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.provider.report_calls(), 0);
    }

    #[tokio::test]
    async fn pagination_stops_at_max_rows_and_marks_truncation() {
        let h = harness(Setup {
            provider: FakeProvider::with_rows(1_000),
            ..Default::default()
        });
        h.warm_schema("123").await;

        let response = h
            .run(json!({
                "autoPaginate": true,
                "maxRows": 150,
                "payload": {
                    "metrics": ["sessions"],
                    "dimensions": ["date"],
                    "dateRanges": [{"startDate": "2024-01-01", "endDate": "2024-01-07"}],
                    "limit": 100
                }
            }))
            .await
            .unwrap();

        let report = response.body.report().unwrap();
        assert_eq!(report.rows.len(), 150);
        assert!(report.truncated);
        assert_eq!(report.row_count, 1_000);
        assert_eq!(report.rows[149].dimension_values, vec!["d149"]);
        assert_eq!(h.provider.report_calls(), 2);
    }

    #[tokio::test]
    async fn pagination_collects_every_page() {
        let h = harness(Setup {
            provider: FakeProvider::with_rows(250),
            ..Default::default()
        });
        h.warm_schema("123").await;

        let response = h
            .run(json!({
                "autoPaginate": true,
                "payload": {
                    "metrics": ["sessions"],
                    "dimensions": ["date"],
                    "dateRanges": [{"startDate": "2024-01-01", "endDate": "2024-01-07"}],
                    "limit": 100
                }
            }))
            .await
            .unwrap();

        let report = response.body.report().unwrap();
        assert_eq!(report.rows.len(), 250);
        assert!(!report.truncated);
        assert_eq!(h.provider.report_calls(), 3);
    }

    #[tokio::test]
    async fn zero_ttl_persists_nothing() {
        let h = harness(Setup::default());
        h.warm_schema("123").await;
        let entries = h.results.entry_count();
        let shared = h.shared.len();

        let mut query = sessions_by_date();
        query["cacheTtlMsOverride"] = json!(0);
        let first = h.run(query.clone()).await.unwrap();
        let second = h.run(query).await.unwrap();

        assert!(!first.cached && !second.cached);
        assert_eq!(h.results.entry_count(), entries);
        assert_eq!(h.shared.len(), shared);
        assert_eq!(h.provider.report_calls(), 2);
    }

    #[tokio::test]
    async fn revoked_refresh_token_requires_reconnect_once() {
        let h = harness(Setup {
            refresh: Err(RefreshFailure::Rejected {
                status: Some(400),
                code: "invalid_grant".into(),
                description: Some("Token has been expired or revoked.".into()),
            }),
            token_expires_in: chrono::Duration::minutes(-1),
            ..Default::default()
        });
        h.warm_schema("123").await;

        let first = h.run(sessions_by_date()).await.unwrap_err();
        assert_eq!(first.code(), "REAUTH_REQUIRED");
        assert_eq!(
            h.credentials.get("t1").unwrap().status,
            CredentialStatus::NeedsReconnect
        );

        let second = h.run(sessions_by_date()).await.unwrap_err();
        assert_eq!(second.code(), "REAUTH_REQUIRED");
        assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.provider.report_calls(), 0);
        assert_eq!(
            h.executor
                .circuit()
                .local_table()
                .failure_count(&provider_resource("123")),
            0
        );
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_before_the_call() {
        let h = harness(Setup {
            token_expires_in: chrono::Duration::seconds(30),
            ..Default::default()
        });
        h.warm_schema("123").await;

        h.run(sessions_by_date()).await.unwrap();

        assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.credentials.get("t1").unwrap().status,
            CredentialStatus::Connected
        );
    }

    #[tokio::test]
    async fn unselected_property_is_refused_unless_skipped() {
        let h = harness(Setup::default());
        h.warm_schema("999").await;

        let mut query = sessions_by_date();
        query["propertyId"] = json!("999");
        let err = h.run(query.clone()).await.unwrap_err();
        assert_eq!(err.code(), "PROPERTY_NOT_SELECTED");
        assert_eq!(h.provider.report_calls(), 0);

        query["skipSelectionCheck"] = json!(true);
        h.run(query).await.unwrap();
        assert_eq!(h.provider.report_calls(), 1);
    }

    #[tokio::test]
    async fn caller_rate_limit_applies_to_live_calls() {
        let h = harness(Setup {
            governor: GovernorConfig {
                rate_limit_max: 2,
                ..Default::default()
            },
            ..Default::default()
        });
        h.warm_schema("123").await;

        let mut query = sessions_by_date();
        query["callerKey"] = json!("dashboard");
        query["cacheTtlMsOverride"] = json!(0);

        h.run(query.clone()).await.unwrap();
        h.run(query.clone()).await.unwrap();
        let err = h.run(query).await.unwrap_err();

        assert_eq!(err.code(), "RATE_LIMIT");
        assert_eq!(h.provider.report_calls(), 2);
    }

    #[tokio::test]
    async fn cache_hits_do_not_count_against_the_rate_limit() {
        let h = harness(Setup {
            governor: GovernorConfig {
                rate_limit_max: 1,
                ..Default::default()
            },
            ..Default::default()
        });
        h.warm_schema("123").await;

        let mut query = sessions_by_date();
        query["callerKey"] = json!("dashboard");
        for _ in 0..3 {
            h.run(query.clone()).await.unwrap();
        }
        assert_eq!(h.provider.report_calls(), 1);
    }

    #[tokio::test]
    async fn provider_rejection_is_mapped_and_logged() {
        let h = harness(Setup::default());
        h.warm_schema("123").await;
        h.provider.fail_next(http_error(400));

        let err = h.run(sessions_by_date()).await.unwrap_err();

        match err {
            QueryError::Provider {
                status, violations, ..
            } => {
                assert_eq!(status, Some(400));
                assert_eq!(violations, vec!["dimensions[0]".to_string()]);
            }
            other => panic!("expected Provider, got {:?}", other),
        }
        assert_eq!(h.provider.report_calls(), 1);
        let logs = h.call_logs.pop_batch(10);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].http_status, Some(400));
        assert!(logs[0].error.is_some());
        assert_eq!(
            h.executor
                .circuit()
                .local_table()
                .failure_count(&provider_resource("123")),
            1
        );
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let h = harness(Setup::default());
        h.warm_schema("123").await;
        h.provider.fail_next(http_error(503));

        let response = h.run(sessions_by_date()).await.unwrap();

        assert!(!response.cached);
        assert_eq!(h.provider.report_calls(), 2);
        let logs = h.call_logs.pop_batch(10);
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].http_status, Some(503));
        assert_eq!(logs[1].http_status, Some(200));
        assert_eq!(logs[0].request_hash, response.request_hash);
    }

    #[tokio::test]
    async fn quota_is_returned_only_when_requested() {
        let h = harness(Setup::default());
        h.warm_schema("123").await;

        let mut query = sessions_by_date();
        query["payload"]["returnPropertyQuota"] = json!(true);
        let response = h.run(query).await.unwrap();

        assert!(response.body.report().unwrap().quota.is_some());
    }

    #[tokio::test]
    async fn metadata_kind_reuses_the_schema_cache() {
        let h = harness(Setup::default());
        h.warm_schema("123").await;

        let response = h.run(json!({ "kind": "METADATA" })).await.unwrap();

        assert!(response.cached);
        assert_eq!(response.body, ResponseBody::Metadata(schema()));
        assert_eq!(h.provider.metadata_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn compatibility_without_metrics_is_never_cached() {
        let h = harness(Setup::default());
        h.warm_schema("123").await;
        let query = json!({
            "kind": "COMPATIBILITY",
            "payload": { "dimensions": ["country"] }
        });

        let first = h.run(query.clone()).await.unwrap();
        let second = h.run(query).await.unwrap();

        assert!(!first.cached && !second.cached);
        match first.body {
            ResponseBody::Compatibility(verdict) => {
                assert!(!verdict.compatible);
                assert_eq!(verdict.incompatible_dimensions, vec!["country".to_string()]);
            }
            other => panic!("unexpected body {:?}", other),
        }
        assert_eq!(h.provider.report_calls(), 2);
    }

    #[tokio::test]
    async fn batch_reports_go_out_as_one_call() {
        let h = harness(Setup::default());
        h.warm_schema("123").await;

        let response = h
            .run(json!({
                "kind": "BATCH_REPORT",
                "payload": {
                    "requests": [
                        {
                            "metrics": ["sessions"],
                            "dateRanges": [{"startDate": "2024-01-01", "endDate": "2024-01-07"}]
                        },
                        {
                            "metrics": ["activeUsers"],
                            "dimensions": ["country"],
                            "dateRanges": [{"startDate": "yesterday", "endDate": "today"}]
                        }
                    ]
                }
            }))
            .await
            .unwrap();

        match response.body {
            ResponseBody::BatchReport(batch) => assert_eq!(batch.reports.len(), 2),
            other => panic!("unexpected body {:?}", other),
        }
        assert_eq!(h.provider.report_calls(), 1);
    }

    #[tokio::test]
    async fn realtime_is_not_cached_by_default() {
        let h = harness(Setup::default());
        h.warm_schema("123").await;
        let query = json!({
            "kind": "REALTIME",
            "payload": {
                "metrics": ["activeUsers"],
                "minuteRanges": [{"startMinutesAgo": 29}]
            }
        });

        assert!(!h.run(query.clone()).await.unwrap().cached);
        assert!(!h.run(query).await.unwrap().cached);
        assert_eq!(h.provider.report_calls(), 2);
    }
}
