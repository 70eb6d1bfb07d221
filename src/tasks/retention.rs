//! Retention task - prunes old call logs and reaps expired cache rows

use crate::store::ResultStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Background task that runs the retention sweep every 6 hours.
///
/// Cache reads already ignore expired rows; this only reclaims space.
pub async fn retention_task(store: Arc<dyn ResultStore>, retention_days: i32) {
    // Wait 1 minute before starting to allow system to stabilize
    tokio::time::sleep(Duration::from_secs(60)).await;

    let mut interval = tokio::time::interval(Duration::from_secs(6 * 60 * 60));

    info!(retention_days, "Retention task started (6h interval)");

    loop {
        interval.tick().await;
        run_retention(store.as_ref(), retention_days).await;
    }
}

/// One sweep. Returns `(call_logs_deleted, cache_rows_deleted)`.
pub async fn run_retention(store: &dyn ResultStore, retention_days: i32) -> (u64, u64) {
    let now = Utc::now();
    let cutoff = now - chrono::Duration::days(retention_days.max(1) as i64);

    let logs = match store.prune_call_logs(cutoff).await {
        Ok(deleted) => {
            if deleted > 0 {
                info!(deleted, "Pruned old call logs");
            }
            deleted
        }
        Err(e) => {
            error!(error = %e, "Failed to prune call logs");
            0
        }
    };

    let entries = match store.purge_expired_entries(now).await {
        Ok(deleted) => {
            if deleted > 0 {
                info!(deleted, "Reaped expired cache entries");
            }
            deleted
        }
        Err(e) => {
            error!(error = %e, "Failed to reap expired cache entries");
            0
        }
    };

    (logs, entries)
}
