//! Flush task - moves call logs from the buffer to the persistent store

use crate::buffer::CallLogBuffer;
use crate::routes::metrics::Metrics;
use crate::store::ResultStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const BATCH_SIZE: usize = 1_000;

/// Background task that periodically drains the call-log buffer.
pub async fn flush_task(buffer: CallLogBuffer, store: Arc<dyn ResultStore>, metrics: Arc<Metrics>) {
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);

    info!("Call log flush task started (5s interval)");

    loop {
        interval.tick().await;
        flush_pending(&buffer, store.as_ref(), &metrics).await;
    }
}

/// Drain everything currently buffered. Returns the number of rows written.
pub async fn flush_pending(
    buffer: &CallLogBuffer,
    store: &dyn ResultStore,
    metrics: &Metrics,
) -> usize {
    let mut written = 0;
    loop {
        let batch = buffer.pop_batch(BATCH_SIZE);
        if batch.is_empty() {
            return written;
        }

        let batch_size = batch.len();
        debug!(batch_size, "Flushing call log batch");

        match store.append_call_logs(&batch).await {
            Ok(inserted) => {
                if inserted < batch_size {
                    error!(inserted, expected = batch_size, "Some call logs failed to insert");
                    metrics.inc_best_effort_failures();
                }
                written += inserted;
            }
            Err(e) => {
                // the batch is lost; logging never holds up queries
                error!(error = %e, batch_size, "Failed to insert call log batch");
                metrics.inc_best_effort_failures();
            }
        }

        if batch_size < BATCH_SIZE {
            return written;
        }
    }
}
