//! HTTPS client for the analytics Data API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{AnalyticsProvider, ProviderError};
use crate::filter::FilterExpression;
use crate::models::{
    CompatibilityPayload, CompatibilityVerdict, DateRange, MetadataSchema, MetricHeader,
    MinuteRange, OrderBy, RealtimePayload, ReportData, ReportPayload, ReportRow,
};

#[derive(Debug, Clone)]
pub struct HttpProvider {
    client: Client,
    base_url: String,
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

impl HttpProvider {
    /// Per-call deadlines are enforced by the reliability executor.
    pub fn new(base_url: &str) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }

    fn url(&self, property_id: &str, method: &str) -> String {
        format!("{}/properties/{}{}", self.base_url, property_id, method)
    }

    async fn call<B, R>(
        &self,
        method: Method,
        url: String,
        access_token: &str,
        body: Option<&B>,
    ) -> Result<R, ProviderError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        debug!(url = %url, "Calling analytics provider");
        let mut request = self.client.request(method, &url).bearer_auth(access_token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(transport)?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(transport)?;

        if !status.is_success() {
            return Err(parse_error(status.as_u16(), &bytes));
        }
        serde_json::from_slice(&bytes).map_err(|e| ProviderError::Decode(e.to_string()))
    }
}

fn transport(err: reqwest::Error) -> ProviderError {
    ProviderError::Transport {
        message: err.to_string(),
        timeout_ms: err
            .is_timeout()
            .then(|| CONNECT_TIMEOUT.as_millis() as u64),
    }
}

#[async_trait]
impl AnalyticsProvider for HttpProvider {
    async fn run_report(
        &self,
        access_token: &str,
        property_id: &str,
        request: &ReportPayload,
    ) -> Result<ReportData, ProviderError> {
        let wire: WireReport = self
            .call(
                Method::POST,
                self.url(property_id, ":runReport"),
                access_token,
                Some(&WireReportRequest::from(request)),
            )
            .await?;
        Ok(wire.into())
    }

    async fn run_realtime_report(
        &self,
        access_token: &str,
        property_id: &str,
        request: &RealtimePayload,
    ) -> Result<ReportData, ProviderError> {
        let wire: WireReport = self
            .call(
                Method::POST,
                self.url(property_id, ":runRealtimeReport"),
                access_token,
                Some(&WireRealtimeRequest::from(request)),
            )
            .await?;
        Ok(wire.into())
    }

    async fn batch_run_reports(
        &self,
        access_token: &str,
        property_id: &str,
        requests: &[ReportPayload],
    ) -> Result<Vec<ReportData>, ProviderError> {
        let body = WireBatchRequest {
            requests: requests.iter().map(WireReportRequest::from).collect(),
        };
        let wire: WireBatchResponse = self
            .call(
                Method::POST,
                self.url(property_id, ":batchRunReports"),
                access_token,
                Some(&body),
            )
            .await?;
        Ok(wire.reports.into_iter().map(ReportData::from).collect())
    }

    async fn check_compatibility(
        &self,
        access_token: &str,
        property_id: &str,
        request: &CompatibilityPayload,
    ) -> Result<CompatibilityVerdict, ProviderError> {
        let body = WireCompatibilityRequest {
            metrics: named(&request.metrics),
            dimensions: named(&request.dimensions),
            dimension_filter: request.dimension_filter.as_ref(),
            metric_filter: request.metric_filter.as_ref(),
        };
        let wire: WireCompatibility = self
            .call(
                Method::POST,
                self.url(property_id, ":checkCompatibility"),
                access_token,
                Some(&body),
            )
            .await?;
        Ok(wire.into())
    }

    async fn get_metadata(
        &self,
        access_token: &str,
        property_id: &str,
    ) -> Result<MetadataSchema, ProviderError> {
        let wire: WireMetadata = self
            .call::<(), _>(
                Method::GET,
                self.url(property_id, "/metadata"),
                access_token,
                None,
            )
            .await?;
        Ok(MetadataSchema {
            metrics: wire.metrics.into_iter().map(|m| m.api_name).collect(),
            dimensions: wire.dimensions.into_iter().map(|d| d.api_name).collect(),
        })
    }
}

// Request bodies

#[derive(Serialize)]
struct Named<'a> {
    name: &'a str,
}

fn named(names: &[String]) -> Vec<Named<'_>> {
    names.iter().map(|name| Named { name }).collect()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireReportRequest<'a> {
    metrics: Vec<Named<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    dimensions: Vec<Named<'a>>,
    date_ranges: &'a [DateRange],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimension_filter: Option<&'a FilterExpression>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metric_filter: Option<&'a FilterExpression>,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    order_bys: &'a [OrderBy],
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<u64>,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    metric_aggregations: &'a [String],
    keep_empty_rows: bool,
    return_property_quota: bool,
}

impl<'a> From<&'a ReportPayload> for WireReportRequest<'a> {
    fn from(p: &'a ReportPayload) -> Self {
        Self {
            metrics: named(&p.metrics),
            dimensions: named(&p.dimensions),
            date_ranges: &p.date_ranges,
            dimension_filter: p.dimension_filter.as_ref(),
            metric_filter: p.metric_filter.as_ref(),
            order_bys: &p.order_bys,
            limit: p.limit,
            offset: p.offset,
            metric_aggregations: &p.metric_aggregations,
            keep_empty_rows: p.keep_empty_rows,
            return_property_quota: p.return_property_quota,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRealtimeRequest<'a> {
    metrics: Vec<Named<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    dimensions: Vec<Named<'a>>,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    minute_ranges: &'a [MinuteRange],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimension_filter: Option<&'a FilterExpression>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metric_filter: Option<&'a FilterExpression>,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    order_bys: &'a [OrderBy],
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<u64>,
    return_property_quota: bool,
}

impl<'a> From<&'a RealtimePayload> for WireRealtimeRequest<'a> {
    fn from(p: &'a RealtimePayload) -> Self {
        Self {
            metrics: named(&p.metrics),
            dimensions: named(&p.dimensions),
            minute_ranges: &p.minute_ranges,
            dimension_filter: p.dimension_filter.as_ref(),
            metric_filter: p.metric_filter.as_ref(),
            order_bys: &p.order_bys,
            limit: p.limit,
            return_property_quota: p.return_property_quota,
        }
    }
}

#[derive(Serialize)]
struct WireBatchRequest<'a> {
    requests: Vec<WireReportRequest<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireCompatibilityRequest<'a> {
    metrics: Vec<Named<'a>>,
    dimensions: Vec<Named<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimension_filter: Option<&'a FilterExpression>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metric_filter: Option<&'a FilterExpression>,
}

// Response bodies

#[derive(Deserialize)]
struct WireHeader {
    name: String,
}

#[derive(Deserialize)]
struct WireMetricHeader {
    name: String,
    #[serde(rename = "type", default)]
    metric_type: Option<String>,
}

#[derive(Deserialize)]
struct WireValue {
    #[serde(default)]
    value: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRow {
    #[serde(default)]
    dimension_values: Vec<WireValue>,
    #[serde(default)]
    metric_values: Vec<WireValue>,
}

impl From<WireRow> for ReportRow {
    fn from(row: WireRow) -> Self {
        let values = |v: Vec<WireValue>| -> Vec<String> {
            v.into_iter().map(|v| v.value.unwrap_or_default()).collect()
        };
        ReportRow {
            dimension_values: values(row.dimension_values),
            metric_values: values(row.metric_values),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireReport {
    #[serde(default)]
    dimension_headers: Vec<WireHeader>,
    #[serde(default)]
    metric_headers: Vec<WireMetricHeader>,
    #[serde(default)]
    rows: Vec<WireRow>,
    #[serde(default)]
    totals: Vec<WireRow>,
    #[serde(default)]
    row_count: Option<u64>,
    #[serde(default)]
    property_quota: Option<Value>,
}

impl From<WireReport> for ReportData {
    fn from(wire: WireReport) -> Self {
        let rows: Vec<ReportRow> = wire.rows.into_iter().map(ReportRow::from).collect();
        // rowCount is omitted when zero
        let row_count = wire.row_count.unwrap_or(rows.len() as u64);
        ReportData {
            dimension_headers: wire.dimension_headers.into_iter().map(|h| h.name).collect(),
            metric_headers: wire
                .metric_headers
                .into_iter()
                .map(|h| MetricHeader {
                    name: h.name,
                    metric_type: h
                        .metric_type
                        .unwrap_or_else(|| "METRIC_TYPE_UNSPECIFIED".to_string()),
                })
                .collect(),
            rows,
            totals: wire.totals.into_iter().map(ReportRow::from).collect(),
            row_count,
            quota: wire.property_quota,
            truncated: false,
        }
    }
}

#[derive(Deserialize)]
struct WireBatchResponse {
    #[serde(default)]
    reports: Vec<WireReport>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireApiName {
    api_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireDimensionCompatibility {
    dimension_metadata: Option<WireApiName>,
    compatibility: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMetricCompatibility {
    metric_metadata: Option<WireApiName>,
    compatibility: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCompatibility {
    #[serde(default)]
    dimension_compatibilities: Vec<WireDimensionCompatibility>,
    #[serde(default)]
    metric_compatibilities: Vec<WireMetricCompatibility>,
}

fn is_incompatible(compatibility: &Option<String>) -> bool {
    compatibility.as_deref() == Some("INCOMPATIBLE")
}

impl From<WireCompatibility> for CompatibilityVerdict {
    fn from(wire: WireCompatibility) -> Self {
        let incompatible_dimensions: Vec<String> = wire
            .dimension_compatibilities
            .into_iter()
            .filter(|c| is_incompatible(&c.compatibility))
            .filter_map(|c| c.dimension_metadata.map(|m| m.api_name))
            .collect();
        let incompatible_metrics: Vec<String> = wire
            .metric_compatibilities
            .into_iter()
            .filter(|c| is_incompatible(&c.compatibility))
            .filter_map(|c| c.metric_metadata.map(|m| m.api_name))
            .collect();
        CompatibilityVerdict {
            compatible: incompatible_dimensions.is_empty() && incompatible_metrics.is_empty(),
            incompatible_metrics,
            incompatible_dimensions,
        }
    }
}

#[derive(Deserialize)]
struct WireMetadata {
    #[serde(default)]
    dimensions: Vec<WireApiName>,
    #[serde(default)]
    metrics: Vec<WireApiName>,
}

#[derive(Deserialize)]
struct WireErrorEnvelope {
    error: WireError,
}

#[derive(Deserialize)]
struct WireError {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    details: Vec<Value>,
}

/// Status, reason and field violations from a Google-style error body.
fn parse_error(status: u16, body: &[u8]) -> ProviderError {
    let Ok(envelope) = serde_json::from_slice::<WireErrorEnvelope>(body) else {
        return ProviderError::Http {
            status,
            reason: None,
            message: String::from_utf8_lossy(body).chars().take(500).collect(),
            violations: Vec::new(),
        };
    };

    let mut violations = Vec::new();
    for detail in &envelope.error.details {
        for key in ["fieldViolations", "violations"] {
            let Some(items) = detail.get(key).and_then(Value::as_array) else {
                continue;
            };
            for item in items {
                let description = item.get("description").and_then(Value::as_str).unwrap_or("");
                match item
                    .get("field")
                    .or_else(|| item.get("subject"))
                    .and_then(Value::as_str)
                {
                    Some(field) if !field.is_empty() => {
                        violations.push(format!("{}: {}", field, description))
                    }
                    _ => violations.push(description.to_string()),
                }
            }
        }
    }

    ProviderError::Http {
        status,
        reason: envelope.error.status,
        message: envelope
            .error
            .message
            .unwrap_or_else(|| format!("HTTP {}", status)),
        violations,
    }
}
