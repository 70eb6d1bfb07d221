//! Request normalization: bounds checks and canonical ordering.
//!
//! Nothing here touches the cache or the network. A request that fails
//! normalization is a `400` for the caller.

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::RequestLimits;
use crate::error::{QueryError, Result};
use crate::filter::FilterExpression;
use crate::models::{
    BatchPayload, CompatibilityPayload, DateRange, MinuteRange, NormalizedPayload,
    NormalizedRequest, OrderBy, PageMode, QueryKind, RealtimePayload, ReportPayload, RunQuery,
};

const REALTIME_MAX_MINUTES_AGO: u32 = 29;
const MAX_MINUTE_RANGES: usize = 2;
const METRIC_AGGREGATIONS: [&str; 4] = ["TOTAL", "MINIMUM", "MAXIMUM", "COUNT"];

#[derive(Debug, Clone)]
pub struct Normalizer {
    limits: RequestLimits,
}

impl Normalizer {
    pub fn new(limits: RequestLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &RequestLimits {
        &self.limits
    }

    pub fn normalize(&self, input: &RunQuery) -> Result<NormalizedRequest> {
        require_id("tenantId", &input.tenant_id)?;
        let property_id = normalize_property_id(&input.property_id)?;

        let (payload, page_mode, max_rows) = match input.kind {
            QueryKind::Report => {
                let report = self.report(parse_payload(input.kind, &input.payload)?)?;
                if input.auto_paginate {
                    (
                        NormalizedPayload::Report(report),
                        PageMode::All,
                        Some(self.max_rows(input.max_rows)?),
                    )
                } else {
                    (NormalizedPayload::Report(report), PageMode::One, None)
                }
            }
            QueryKind::Realtime => (
                NormalizedPayload::Realtime(
                    self.realtime(parse_payload(input.kind, &input.payload)?)?,
                ),
                PageMode::One,
                None,
            ),
            QueryKind::Compatibility => (
                NormalizedPayload::Compatibility(
                    self.compatibility(parse_payload(input.kind, &input.payload)?)?,
                ),
                PageMode::One,
                None,
            ),
            QueryKind::BatchReport => (
                NormalizedPayload::BatchReport(
                    self.batch(parse_payload(input.kind, &input.payload)?)?,
                ),
                PageMode::One,
                None,
            ),
            QueryKind::Metadata => (NormalizedPayload::Metadata, PageMode::One, None),
        };

        Ok(NormalizedRequest {
            kind: input.kind,
            property_id,
            page_mode,
            max_rows,
            payload,
        })
    }

    fn max_rows(&self, requested: Option<u64>) -> Result<u64> {
        match requested {
            Some(0) => Err(QueryError::validation("maxRows must be positive")),
            Some(rows) => Ok(rows.min(self.limits.max_total_rows)),
            None => Ok(self.limits.max_total_rows),
        }
    }

    pub fn report(&self, mut payload: ReportPayload) -> Result<ReportPayload> {
        payload.metrics = canonical_names("metrics", payload.metrics, self.limits.max_metrics)?;
        payload.dimensions =
            canonical_names("dimensions", payload.dimensions, self.limits.max_dimensions)?;
        if payload.metrics.is_empty() && payload.dimensions.is_empty() {
            return Err(QueryError::validation(
                "at least one metric or dimension is required",
            ));
        }

        if payload.date_ranges.is_empty() {
            return Err(QueryError::validation("at least one date range is required"));
        }
        if payload.date_ranges.len() > self.limits.max_date_ranges {
            return Err(QueryError::validation(format!(
                "too many date ranges: {} (max {})",
                payload.date_ranges.len(),
                self.limits.max_date_ranges
            )));
        }
        payload.date_ranges.iter().try_for_each(check_date_range)?;

        payload.dimension_filter = self.filter(payload.dimension_filter.take())?;
        payload.metric_filter = self.filter(payload.metric_filter.take())?;
        check_order_bys(&payload.order_bys)?;
        self.check_paging(payload.limit, payload.offset)?;

        let mut aggregations = payload.metric_aggregations;
        aggregations.sort();
        aggregations.dedup();
        if let Some(bad) = aggregations
            .iter()
            .find(|a| !METRIC_AGGREGATIONS.contains(&a.as_str()))
        {
            return Err(QueryError::validation(format!(
                "unsupported metric aggregation '{}'",
                bad
            )));
        }
        payload.metric_aggregations = aggregations;

        Ok(payload)
    }

    fn realtime(&self, mut payload: RealtimePayload) -> Result<RealtimePayload> {
        payload.metrics = canonical_names("metrics", payload.metrics, self.limits.max_metrics)?;
        payload.dimensions =
            canonical_names("dimensions", payload.dimensions, self.limits.max_dimensions)?;
        if payload.metrics.is_empty() && payload.dimensions.is_empty() {
            return Err(QueryError::validation(
                "at least one metric or dimension is required",
            ));
        }
        if payload.minute_ranges.len() > MAX_MINUTE_RANGES {
            return Err(QueryError::validation(format!(
                "too many minute ranges: {} (max {})",
                payload.minute_ranges.len(),
                MAX_MINUTE_RANGES
            )));
        }
        payload.minute_ranges.iter().try_for_each(check_minute_range)?;
        payload.dimension_filter = self.filter(payload.dimension_filter.take())?;
        payload.metric_filter = self.filter(payload.metric_filter.take())?;
        check_order_bys(&payload.order_bys)?;
        self.check_paging(payload.limit, None)?;
        Ok(payload)
    }

    fn compatibility(&self, mut payload: CompatibilityPayload) -> Result<CompatibilityPayload> {
        payload.metrics = canonical_names("metrics", payload.metrics, self.limits.max_metrics)?;
        payload.dimensions =
            canonical_names("dimensions", payload.dimensions, self.limits.max_dimensions)?;
        payload.dimension_filter = self.filter(payload.dimension_filter.take())?;
        payload.metric_filter = self.filter(payload.metric_filter.take())?;
        Ok(payload)
    }

    fn batch(&self, payload: BatchPayload) -> Result<BatchPayload> {
        if payload.requests.is_empty() {
            return Err(QueryError::validation("batch contains no requests"));
        }
        if payload.requests.len() > self.limits.max_batch_requests {
            return Err(QueryError::validation(format!(
                "too many batch requests: {} (max {})",
                payload.requests.len(),
                self.limits.max_batch_requests
            )));
        }
        let requests = payload
            .requests
            .into_iter()
            .enumerate()
            .map(|(i, report)| {
                self.report(report).map_err(|e| match e {
                    QueryError::Validation {
                        message,
                        invalid_fields,
                    } => QueryError::Validation {
                        message: format!("requests[{}]: {}", i, message),
                        invalid_fields,
                    },
                    other => other,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(BatchPayload { requests })
    }

    fn filter(&self, filter: Option<FilterExpression>) -> Result<Option<FilterExpression>> {
        match filter {
            None => Ok(None),
            Some(expr) => {
                expr.check_complexity(self.limits.filter_max_depth, self.limits.filter_max_nodes)?;
                expr.check_shape()?;
                Ok(Some(expr.canonicalize()))
            }
        }
    }

    fn check_paging(&self, limit: Option<u64>, offset: Option<u64>) -> Result<()> {
        if let Some(limit) = limit {
            if limit == 0 || limit > self.limits.max_limit {
                return Err(QueryError::validation(format!(
                    "limit must be between 1 and {}",
                    self.limits.max_limit
                )));
            }
        }
        if let Some(offset) = offset {
            if offset > self.limits.max_offset {
                return Err(QueryError::validation(format!(
                    "offset must not exceed {}",
                    self.limits.max_offset
                )));
            }
        }
        Ok(())
    }
}

fn parse_payload<T: DeserializeOwned + Default>(kind: QueryKind, payload: &Value) -> Result<T> {
    if payload.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(payload.clone())
        .map_err(|e| QueryError::validation(format!("invalid {} payload: {}", kind.as_str(), e)))
}

fn require_id(label: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(QueryError::validation(format!("{} is required", label)));
    }
    Ok(())
}

/// Accepts `123` or `properties/123`.
fn normalize_property_id(raw: &str) -> Result<String> {
    let id = raw.trim();
    let id = id.strip_prefix("properties/").unwrap_or(id);
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) {
        return Err(QueryError::validation(format!(
            "propertyId '{}' is not a valid property id",
            raw
        )));
    }
    Ok(id.to_string())
}

/// Sorted, de-duplicated, bounded list of field names.
fn canonical_names(label: &str, names: Vec<String>, max: usize) -> Result<Vec<String>> {
    let mut names: Vec<String> = names.into_iter().map(|n| n.trim().to_string()).collect();
    if let Some(bad) = names.iter().find(|n| !is_field_name(n)) {
        return Err(QueryError::validation(format!(
            "invalid name in {}: '{}'",
            label, bad
        )));
    }
    names.sort();
    names.dedup();
    if names.len() > max {
        return Err(QueryError::validation(format!(
            "too many {}: {} (max {})",
            label,
            names.len(),
            max
        )));
    }
    Ok(names)
}

fn is_field_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

fn check_order_bys(order_bys: &[OrderBy]) -> Result<()> {
    for order_by in order_bys {
        match order_by.field_name() {
            Some(name) if is_field_name(name) => {}
            _ => {
                return Err(QueryError::validation(
                    "orderBy must reference a metric or dimension",
                ))
            }
        }
    }
    Ok(())
}

enum DateSpec {
    Absolute(NaiveDate),
    Relative,
}

fn parse_date(raw: &str) -> Option<DateSpec> {
    match raw {
        "today" | "yesterday" => Some(DateSpec::Relative),
        _ => {
            if let Some(days) = raw.strip_suffix("daysAgo") {
                if !days.is_empty() && days.chars().all(|c| c.is_ascii_digit()) {
                    return Some(DateSpec::Relative);
                }
                return None;
            }
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .map(DateSpec::Absolute)
        }
    }
}

fn check_date_range(range: &DateRange) -> Result<()> {
    let start = parse_date(&range.start_date)
        .ok_or_else(|| QueryError::validation(format!("invalid startDate '{}'", range.start_date)))?;
    let end = parse_date(&range.end_date)
        .ok_or_else(|| QueryError::validation(format!("invalid endDate '{}'", range.end_date)))?;
    if let (DateSpec::Absolute(start), DateSpec::Absolute(end)) = (start, end) {
        if start > end {
            return Err(QueryError::validation(format!(
                "startDate {} is after endDate {}",
                start, end
            )));
        }
    }
    Ok(())
}

fn check_minute_range(range: &MinuteRange) -> Result<()> {
    if range.start_minutes_ago > REALTIME_MAX_MINUTES_AGO
        || range.end_minutes_ago > REALTIME_MAX_MINUTES_AGO
    {
        return Err(QueryError::validation(format!(
            "minute ranges must be within 0..={} minutes ago",
            REALTIME_MAX_MINUTES_AGO
        )));
    }
    if range.start_minutes_ago < range.end_minutes_ago {
        return Err(QueryError::validation(
            "startMinutesAgo must be greater than or equal to endMinutesAgo",
        ));
    }
    Ok(())
}
