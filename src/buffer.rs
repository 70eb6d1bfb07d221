//! Lock-free ring buffer for call-log records

use crate::models::CallLogRecord;
use crate::routes::metrics::Metrics;
use crossbeam::queue::ArrayQueue;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

/// Bounded call-log queue backed by crossbeam's ArrayQueue.
///
/// Request handlers push without blocking; the flush task drains it in
/// batches. A full queue drops the record.
#[derive(Clone)]
pub struct CallLogBuffer {
    queue: Arc<ArrayQueue<CallLogRecord>>,
    capacity: usize,
    metrics: Arc<Metrics>,
}

impl CallLogBuffer {
    pub fn new(capacity: usize, metrics: Arc<Metrics>) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: Arc::new(ArrayQueue::new(capacity)),
            capacity,
            metrics,
        }
    }

    /// Try to push a record into the buffer.
    ///
    /// Returns `Err(record)` if the buffer is full.
    pub fn try_push(&self, record: CallLogRecord) -> Result<(), CallLogRecord> {
        self.queue.push(record)
    }

    /// Enqueue a record, counting it as dropped when the buffer is full.
    pub fn record(&self, record: CallLogRecord) {
        if let Err(dropped) = self.try_push(record) {
            self.metrics.inc_call_logs_dropped(1);
            warn!(
                call_log_id = %dropped.id,
                capacity = self.capacity,
                "Call log buffer full, record dropped"
            );
        }
    }

    /// Pop up to `max` records.
    pub fn pop_batch(&self, max: usize) -> Vec<CallLogRecord> {
        let mut batch = Vec::with_capacity(max.min(self.queue.len()));
        for _ in 0..max {
            match self.queue.pop() {
                Some(record) => batch.push(record),
                None => break,
            }
        }
        batch
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Shrink a logged payload so it fits the row and byte ceilings.
///
/// Every `rows` array is cut to `max_rows`, then halved until the JSON fits
/// in `max_bytes`. Payloads that still do not fit are replaced by a marker.
pub fn cap_payload(mut value: Value, max_bytes: usize, max_rows: usize) -> Value {
    let mut trimmed = trim_rows(&mut value, max_rows);
    let mut keep = max_rows;
    let mut size = encoded_len(&value);

    while size > max_bytes && keep > 0 {
        keep /= 2;
        trimmed |= trim_rows(&mut value, keep);
        size = encoded_len(&value);
    }

    if size > max_bytes {
        return json!({ "truncated": true, "originalBytes": size });
    }
    if trimmed {
        if let Value::Object(map) = &mut value {
            map.insert("rowsTruncated".to_string(), Value::Bool(true));
        }
    }
    value
}

fn encoded_len(value: &Value) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(usize::MAX)
}

fn trim_rows(value: &mut Value, keep: usize) -> bool {
    match value {
        Value::Object(map) => {
            let mut trimmed = false;
            for (key, child) in map.iter_mut() {
                if key != "rows" {
                    trimmed |= trim_rows(child, keep);
                } else if let Value::Array(rows) = child {
                    if rows.len() > keep {
                        rows.truncate(keep);
                        trimmed = true;
                    }
                }
            }
            trimmed
        }
        Value::Array(items) => items
            .iter_mut()
            .fold(false, |trimmed, item| trim_rows(item, keep) || trimmed),
        _ => false,
    }
}
