//! Health and readiness endpoints

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::state::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub strategy: &'static str,
}

/// Readiness check response
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub checks: ReadinessChecks,
}

#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    pub database: CheckStatus,
    pub redis: CheckStatus,
    pub call_log_buffer: CheckStatus,
}

#[derive(Debug, Serialize)]
pub struct CheckStatus {
    pub healthy: bool,
    pub message: String,
}

/// GET /health
///
/// Basic health check - returns 200 if the server is running
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        strategy: state.orchestrator.strategy_name(),
    })
}

/// GET /ready
///
/// Readiness check. Postgres is required; Redis only degrades readiness
/// because every shared structure has an in-process fallback.
pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadinessResponse>) {
    let db_check = match &state.db {
        Some(db) => match sqlx::query("SELECT 1").fetch_one(db.pool()).await {
            Ok(_) => CheckStatus {
                healthy: true,
                message: "Connected".to_string(),
            },
            Err(e) => CheckStatus {
                healthy: false,
                message: format!("Connection failed: {}", e),
            },
        },
        None => CheckStatus {
            healthy: true,
            message: "Not configured, using in-memory stores".to_string(),
        },
    };

    let redis_check = match &state.redis {
        Some(redis) => match redis.ping().await {
            Ok(()) => CheckStatus {
                healthy: true,
                message: "Connected".to_string(),
            },
            Err(e) => CheckStatus {
                healthy: false,
                message: format!("Unavailable, using in-process fallback: {}", e),
            },
        },
        None => CheckStatus {
            healthy: true,
            message: "Not configured, using in-process governor and cache".to_string(),
        },
    };

    let depth = state.call_logs.len();
    let buffer_check = CheckStatus {
        healthy: depth < state.call_logs.capacity(),
        message: format!("{} of {} slots used", depth, state.call_logs.capacity()),
    };

    let (status, status_code) = readiness(&db_check, &redis_check);

    (
        status_code,
        Json(ReadinessResponse {
            status,
            checks: ReadinessChecks {
                database: db_check,
                redis: redis_check,
                call_log_buffer: buffer_check,
            },
        }),
    )
}

fn readiness(db: &CheckStatus, redis: &CheckStatus) -> (&'static str, StatusCode) {
    match (db.healthy, redis.healthy) {
        (false, _) => ("not_ready", StatusCode::SERVICE_UNAVAILABLE),
        (true, false) => ("degraded", StatusCode::OK),
        (true, true) => ("ready", StatusCode::OK),
    }
}
