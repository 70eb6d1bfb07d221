//! Core domain models for the analytics query layer

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::filter::FilterExpression;

/// Category of query issued against the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryKind {
    Report,
    Realtime,
    Compatibility,
    BatchReport,
    Metadata,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::Report => "REPORT",
            QueryKind::Realtime => "REALTIME",
            QueryKind::Compatibility => "COMPATIBILITY",
            QueryKind::BatchReport => "BATCH_REPORT",
            QueryKind::Metadata => "METADATA",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "REPORT" => Some(QueryKind::Report),
            "REALTIME" => Some(QueryKind::Realtime),
            "COMPATIBILITY" => Some(QueryKind::Compatibility),
            "BATCH_REPORT" => Some(QueryKind::BatchReport),
            "METADATA" => Some(QueryKind::Metadata),
            _ => None,
        }
    }
}

/// Inbound call: one analytics query on behalf of a tenant user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunQuery {
    pub tenant_id: String,
    pub user_id: String,
    pub property_id: String,
    pub kind: QueryKind,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub caller_key: Option<String>,
    #[serde(default)]
    pub cache_ttl_ms_override: Option<i64>,
    /// Set by system jobs that already know the property is valid.
    #[serde(default)]
    pub skip_selection_check: bool,
    #[serde(default)]
    pub auto_paginate: bool,
    #[serde(default)]
    pub max_rows: Option<u64>,
}

/// Date range, absolute (`YYYY-MM-DD`) or preset (`today`, `yesterday`, `NdaysAgo`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateRange {
    pub start_date: String,
    pub end_date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Realtime window expressed in minutes before now (0..=29).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinuteRange {
    pub start_minutes_ago: u32,
    #[serde(default)]
    pub end_minutes_ago: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricOrderBy {
    pub metric_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DimensionOrderBy {
    pub dimension_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<MetricOrderBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimension: Option<DimensionOrderBy>,
    #[serde(default)]
    pub desc: bool,
}

impl OrderBy {
    pub fn metric(name: &str, desc: bool) -> Self {
        Self {
            metric: Some(MetricOrderBy {
                metric_name: name.to_string(),
            }),
            dimension: None,
            desc,
        }
    }

    pub fn dimension(name: &str, desc: bool) -> Self {
        Self {
            metric: None,
            dimension: Some(DimensionOrderBy {
                dimension_name: name.to_string(),
                order_type: None,
            }),
            desc,
        }
    }

    /// The referenced field, if the entry names one.
    pub fn field_name(&self) -> Option<&str> {
        self.metric
            .as_ref()
            .map(|m| m.metric_name.as_str())
            .or_else(|| self.dimension.as_ref().map(|d| d.dimension_name.as_str()))
    }
}

/// Standard (historical) report payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportPayload {
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub date_ranges: Vec<DateRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimension_filter: Option<FilterExpression>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_filter: Option<FilterExpression>,
    #[serde(default)]
    pub order_bys: Vec<OrderBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(default)]
    pub metric_aggregations: Vec<String>,
    #[serde(default)]
    pub keep_empty_rows: bool,
    #[serde(default)]
    pub return_property_quota: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimePayload {
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub minute_ranges: Vec<MinuteRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimension_filter: Option<FilterExpression>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_filter: Option<FilterExpression>,
    #[serde(default)]
    pub order_bys: Vec<OrderBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default)]
    pub return_property_quota: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompatibilityPayload {
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimension_filter: Option<FilterExpression>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_filter: Option<FilterExpression>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPayload {
    #[serde(default)]
    pub requests: Vec<ReportPayload>,
}

/// Whether a report is fetched as one page or paginated to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PageMode {
    One,
    All,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NormalizedPayload {
    Report(ReportPayload),
    Realtime(RealtimePayload),
    Compatibility(CompatibilityPayload),
    BatchReport(BatchPayload),
    Metadata,
}

/// Canonical form of a request; the cache key is derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedRequest {
    pub kind: QueryKind,
    pub property_id: String,
    pub page_mode: PageMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rows: Option<u64>,
    pub payload: NormalizedPayload,
}

/// Every field name a request references, grouped by role.
#[derive(Debug, Clone, Default)]
pub struct FieldRefs<'a> {
    pub metrics: &'a [String],
    pub dimensions: &'a [String],
    pub dimension_filter: Option<&'a FilterExpression>,
    pub metric_filter: Option<&'a FilterExpression>,
    pub order_bys: &'a [OrderBy],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricHeader {
    pub name: String,
    #[serde(rename = "type")]
    pub metric_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRow {
    pub dimension_values: Vec<String>,
    pub metric_values: Vec<String>,
}

/// Normalized report shape returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportData {
    pub dimension_headers: Vec<String>,
    pub metric_headers: Vec<MetricHeader>,
    pub rows: Vec<ReportRow>,
    pub totals: Vec<ReportRow>,
    pub row_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<Value>,
    #[serde(default)]
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchData {
    pub reports: Vec<ReportData>,
}

/// Structural verdict of a compatibility check; never raised as an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompatibilityVerdict {
    pub compatible: bool,
    pub incompatible_metrics: Vec<String>,
    pub incompatible_dimensions: Vec<String>,
}

/// Allowed metric and dimension names for one property.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataSchema {
    pub metrics: BTreeSet<String>,
    pub dimensions: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseBody {
    Report(ReportData),
    Realtime(ReportData),
    Compatibility(CompatibilityVerdict),
    BatchReport(BatchData),
    Metadata(MetadataSchema),
}

impl ResponseBody {
    pub fn report(&self) -> Option<&ReportData> {
        match self {
            ResponseBody::Report(data) | ResponseBody::Realtime(data) => Some(data),
            _ => None,
        }
    }

    /// The untagged payload, as stored in the cache layers.
    pub fn to_data(&self) -> serde_json::Result<Value> {
        match self {
            ResponseBody::Report(data) | ResponseBody::Realtime(data) => serde_json::to_value(data),
            ResponseBody::Compatibility(verdict) => serde_json::to_value(verdict),
            ResponseBody::BatchReport(batch) => serde_json::to_value(batch),
            ResponseBody::Metadata(schema) => serde_json::to_value(schema),
        }
    }

    /// Rebuild a body from a cached payload; the kind comes from the cache key.
    pub fn from_data(kind: QueryKind, data: Value) -> serde_json::Result<Self> {
        Ok(match kind {
            QueryKind::Report => ResponseBody::Report(serde_json::from_value(data)?),
            QueryKind::Realtime => ResponseBody::Realtime(serde_json::from_value(data)?),
            QueryKind::Compatibility => ResponseBody::Compatibility(serde_json::from_value(data)?),
            QueryKind::BatchReport => ResponseBody::BatchReport(serde_json::from_value(data)?),
            QueryKind::Metadata => ResponseBody::Metadata(serde_json::from_value(data)?),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub cached: bool,
    pub request_hash: String,
    #[serde(flatten)]
    pub body: ResponseBody,
}

/// Lifecycle of a tenant's provider connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CredentialStatus {
    Connected,
    NeedsReconnect,
    Error,
    Disconnected,
}

impl CredentialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialStatus::Connected => "CONNECTED",
            CredentialStatus::NeedsReconnect => "NEEDS_RECONNECT",
            CredentialStatus::Error => "ERROR",
            CredentialStatus::Disconnected => "DISCONNECTED",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "CONNECTED" => CredentialStatus::Connected,
            "NEEDS_RECONNECT" => CredentialStatus::NeedsReconnect,
            "ERROR" => CredentialStatus::Error,
            _ => CredentialStatus::Disconnected,
        }
    }
}

/// Per-tenant credential row. Tokens are stored encrypted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub tenant_id: String,
    pub status: CredentialStatus,
    pub access_token_enc: Option<String>,
    pub refresh_token_enc: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub selected_property_id: Option<String>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Composite identity of a persisted cache row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheEntryKey {
    pub tenant_id: String,
    pub property_id: String,
    pub kind: QueryKind,
    pub request_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheEntryKey,
    pub request: Value,
    pub response: Value,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// One row per live provider attempt. Written best-effort.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallLogRecord {
    pub id: Uuid,
    pub tenant_id: String,
    pub property_id: String,
    pub kind: QueryKind,
    pub request_hash: String,
    pub request: Value,
    pub response: Option<Value>,
    pub http_status: Option<i32>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}
