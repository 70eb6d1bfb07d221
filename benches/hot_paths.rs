//! Benchmarks for request hashing and the call-log buffer

use std::sync::Arc;

use analytics_relay::buffer::{cap_payload, CallLogBuffer};
use analytics_relay::hash::stable_hash;
use analytics_relay::models::{CallLogRecord, QueryKind};
use analytics_relay::routes::metrics::Metrics;
use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use serde_json::{json, Value};
use uuid::Uuid;

fn report_request() -> Value {
    json!({
        "kind": "REPORT",
        "tenantId": "tenant-1",
        "propertyId": "properties/123456",
        "ttlMs": 3_600_000,
        "request": {
            "metrics": [{"name": "sessions"}, {"name": "activeUsers"}, {"name": "screenPageViews"}],
            "dimensions": [{"name": "date"}, {"name": "country"}],
            "dateRanges": [{"startDate": "2024-01-01", "endDate": "2024-01-31"}],
            "dimensionFilter": {
                "andGroup": {"expressions": [
                    {"filter": {"fieldName": "country", "stringFilter": {"value": "France"}}},
                    {"notExpression": {"filter": {"fieldName": "city", "stringFilter": {"value": "Paris"}}}}
                ]}
            },
            "limit": 1000,
            "offset": 0
        }
    })
}

fn create_record() -> CallLogRecord {
    CallLogRecord {
        id: Uuid::new_v4(),
        tenant_id: "tenant-1".to_string(),
        property_id: "properties/123456".to_string(),
        kind: QueryKind::Report,
        request_hash: "0".repeat(64),
        request: json!({"metrics": [{"name": "sessions"}]}),
        response: None,
        http_status: Some(200),
        error: None,
        duration_ms: 42,
        created_at: Utc::now(),
    }
}

fn bench_stable_hash(c: &mut Criterion) {
    let request = report_request();
    let mut group = c.benchmark_group("stable_hash");

    group.bench_function("report_request", |b| {
        b.iter(|| stable_hash(black_box(&request)).unwrap());
    });

    group.finish();
}

fn bench_cap_payload(c: &mut Criterion) {
    let rows: Vec<Value> = (0..5_000)
        .map(|i| json!({"dimensionValues": [{"value": format!("2024010{}", i % 9)}], "metricValues": [{"value": i.to_string()}]}))
        .collect();
    let response = json!({"rows": rows, "rowCount": 5_000});

    let mut group = c.benchmark_group("cap_payload");
    group.bench_function("5000_rows", |b| {
        b.iter_batched(
            || response.clone(),
            |value| black_box(cap_payload(value, 64 * 1024, 1_000)),
            criterion::BatchSize::SmallInput,
        );
    });
    group.finish();
}

fn bench_buffer(c: &mut Criterion) {
    let metrics = Arc::new(Metrics::new());
    let mut group = c.benchmark_group("call_log_buffer");
    group.throughput(Throughput::Elements(1000));

    group.bench_function("push_1000_records", |b| {
        b.iter(|| {
            let buffer = CallLogBuffer::new(100_000, metrics.clone());
            for _ in 0..1000 {
                let _ = buffer.try_push(black_box(create_record()));
            }
        });
    });

    group.bench_function("pop_batch_1000", |b| {
        b.iter_batched(
            || {
                let buffer = CallLogBuffer::new(100_000, metrics.clone());
                for _ in 0..1000 {
                    buffer.record(create_record());
                }
                buffer
            },
            |buffer| {
                black_box(buffer.pop_batch(1000));
            },
            criterion::BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_stable_hash, bench_cap_payload, bench_buffer);
criterion_main!(benches);
