//! Post-processing applied to every report before it is cached or returned.

use crate::models::{ReportData, ReportRow};

/// Dimension value used in the synthesized totals row.
pub const TOTAL_ROW_LABEL: &str = "RESERVED_TOTAL";

/// Fill in totals when the provider sent none, and drop the quota block
/// unless the caller asked for it.
pub fn finish_report(mut data: ReportData, keep_quota: bool) -> ReportData {
    if !keep_quota {
        data.quota = None;
    }
    if data.totals.is_empty() && !data.rows.is_empty() {
        data.totals = vec![summed_totals(&data)];
    }
    data
}

/// One row summing every metric column. Columns with a non-numeric cell
/// are left blank.
pub fn summed_totals(data: &ReportData) -> ReportRow {
    let columns = data
        .metric_headers
        .len()
        .max(data.rows.iter().map(|r| r.metric_values.len()).max().unwrap_or(0));

    let metric_values = (0..columns)
        .map(|column| {
            sum_column(
                data.rows
                    .iter()
                    .map(|row| row.metric_values.get(column).map(String::as_str)),
            )
        })
        .collect();

    ReportRow {
        dimension_values: vec![TOTAL_ROW_LABEL.to_string(); data.dimension_headers.len()],
        metric_values,
    }
}

fn sum_column<'a>(cells: impl Iterator<Item = Option<&'a str>>) -> String {
    let mut int_sum: Option<i64> = Some(0);
    let mut float_sum = 0.0f64;

    for cell in cells {
        let Some(cell) = cell.map(str::trim) else {
            return String::new();
        };
        match cell.parse::<f64>() {
            Ok(value) if value.is_finite() => float_sum += value,
            _ => return String::new(),
        }
        int_sum = int_sum.and_then(|sum| cell.parse::<i64>().ok().and_then(|n| sum.checked_add(n)));
    }

    match int_sum {
        Some(sum) => sum.to_string(),
        None => float_sum.to_string(),
    }
}
