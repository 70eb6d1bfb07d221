//! Deterministic stand-in for the provider, for local and demo environments.
//!
//! Responses are shaped like live ones and seeded from the request hash, so
//! the same query always returns the same numbers. Nothing is cached, no
//! slot is taken and no credential is read.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;

use super::report::finish_report;
use super::QueryStrategy;
use crate::error::Result;
use crate::hash::stable_hash;
use crate::models::{
    BatchData, CompatibilityVerdict, MetadataSchema, MetricHeader, NormalizedPayload,
    NormalizedRequest, QueryResponse, ReportData, ReportRow, ResponseBody, RunQuery,
};

const MOCK_ROWS: u64 = 7;

const MOCK_METRICS: [&str; 6] = [
    "activeUsers",
    "bounceRate",
    "conversions",
    "screenPageViews",
    "sessions",
    "totalRevenue",
];

const MOCK_DIMENSIONS: [&str; 6] = [
    "country",
    "date",
    "deviceCategory",
    "pagePath",
    "sessionDefaultChannelGroup",
    "sessionSource",
];

#[derive(Debug, Clone, Default)]
pub struct MockStrategy;

impl MockStrategy {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl QueryStrategy for MockStrategy {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn execute(&self, input: &RunQuery, request: &NormalizedRequest) -> Result<QueryResponse> {
        let request_hash = stable_hash(&json!({
            "kind": request.kind,
            "tenantId": input.tenant_id,
            "request": request,
        }))?;
        let mut rng = StdRng::seed_from_u64(seed(&request_hash));

        let body = match &request.payload {
            NormalizedPayload::Report(report) => {
                let rows = report.limit.unwrap_or(MOCK_ROWS).min(MOCK_ROWS);
                ResponseBody::Report(mock_report(
                    &mut rng,
                    &report.metrics,
                    &report.dimensions,
                    rows,
                ))
            }
            NormalizedPayload::Realtime(realtime) => {
                let rows = realtime.limit.unwrap_or(MOCK_ROWS).min(MOCK_ROWS);
                ResponseBody::Realtime(mock_report(
                    &mut rng,
                    &realtime.metrics,
                    &realtime.dimensions,
                    rows,
                ))
            }
            NormalizedPayload::Compatibility(_) => ResponseBody::Compatibility(CompatibilityVerdict {
                compatible: true,
                incompatible_metrics: Vec::new(),
                incompatible_dimensions: Vec::new(),
            }),
            NormalizedPayload::BatchReport(batch) => ResponseBody::BatchReport(BatchData {
                reports: batch
                    .requests
                    .iter()
                    .map(|r| {
                        let rows = r.limit.unwrap_or(MOCK_ROWS).min(MOCK_ROWS);
                        mock_report(&mut rng, &r.metrics, &r.dimensions, rows)
                    })
                    .collect(),
            }),
            NormalizedPayload::Metadata => ResponseBody::Metadata(MetadataSchema {
                metrics: MOCK_METRICS.iter().map(|s| s.to_string()).collect(),
                dimensions: MOCK_DIMENSIONS.iter().map(|s| s.to_string()).collect(),
            }),
        };

        Ok(QueryResponse {
            cached: false,
            request_hash,
            body,
        })
    }
}

fn seed(request_hash: &str) -> u64 {
    request_hash
        .get(..16)
        .and_then(|prefix| u64::from_str_radix(prefix, 16).ok())
        .unwrap_or(0)
}

fn mock_report(rng: &mut StdRng, metrics: &[String], dimensions: &[String], rows: u64) -> ReportData {
    let rows: Vec<ReportRow> = (0..rows)
        .map(|i| ReportRow {
            dimension_values: dimensions.iter().map(|d| mock_dimension(d, i)).collect(),
            metric_values: metrics
                .iter()
                .map(|_| rng.random_range(0..5_000u32).to_string())
                .collect(),
        })
        .collect();

    let data = ReportData {
        dimension_headers: dimensions.to_vec(),
        metric_headers: metrics
            .iter()
            .map(|name| MetricHeader {
                name: name.clone(),
                metric_type: "TYPE_INTEGER".to_string(),
            })
            .collect(),
        row_count: rows.len() as u64,
        rows,
        totals: Vec::new(),
        quota: None,
        truncated: false,
    };
    finish_report(data, false)
}

fn mock_dimension(name: &str, index: u64) -> String {
    match name {
        "date" => format!("202401{:02}", index + 1),
        _ => format!("{} {}", name, index + 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RequestLimits;
    use crate::models::QueryKind;
    use crate::normalize::Normalizer;
    use crate::orchestrator::QueryOrchestrator;
    use crate::routes::metrics::Metrics;
    use std::sync::Arc;

    fn orchestrator() -> QueryOrchestrator {
        QueryOrchestrator::new(
            Normalizer::new(RequestLimits::default()),
            Arc::new(MockStrategy::new()),
            Arc::new(Metrics::new()),
        )
    }

    fn query(kind: QueryKind, payload: serde_json::Value) -> RunQuery {
        serde_json::from_value(json!({
            "tenantId": "demo",
            "userId": "u1",
            "propertyId": "123",
            "kind": kind,
            "payload": payload,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn same_query_returns_same_numbers() {
        let orchestrator = orchestrator();
        let input = query(
            QueryKind::Report,
            json!({
                "metrics": ["sessions"],
                "dimensions": ["date"],
                "dateRanges": [{"startDate": "2024-01-01", "endDate": "2024-01-07"}]
            }),
        );

        let first = orchestrator.run_query(&input).await.unwrap();
        let second = orchestrator.run_query(&input).await.unwrap();

        assert!(!first.cached && !second.cached);
        assert_eq!(first.body, second.body);
        let report = first.body.report().unwrap();
        assert_eq!(report.rows.len(), MOCK_ROWS as usize);
        assert_eq!(report.rows[0].dimension_values, vec!["20240101"]);
        assert_eq!(report.totals[0].dimension_values, vec!["RESERVED_TOTAL"]);
    }

    #[tokio::test]
    async fn mock_mode_still_normalizes() {
        let err = orchestrator()
            .run_query(&query(QueryKind::Report, json!({ "metrics": ["sessions"] })))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[tokio::test]
    async fn metadata_lists_common_fields() {
        let response = orchestrator()
            .run_query(&query(QueryKind::Metadata, json!({})))
            .await
            .unwrap();
        match response.body {
            ResponseBody::Metadata(schema) => {
                assert!(schema.metrics.contains("sessions"));
                assert!(schema.dimensions.contains("date"));
            }
            other => panic!("unexpected body {:?}", other),
        }
    }
}
