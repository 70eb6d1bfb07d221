//! Query endpoint: the `runQuery` call carried over HTTP

use axum::{extract::State, Json};

use crate::error::Result;
use crate::models::{QueryResponse, RunQuery};
use crate::state::AppState;

/// POST /api/v1/query
///
/// Runs one analytics query. Errors render as
/// `{ error, code, status, details }` with the matching HTTP status.
pub async fn run_query(
    State(state): State<AppState>,
    Json(input): Json<RunQuery>,
) -> Result<Json<QueryResponse>> {
    let response = state.orchestrator.run_query(&input).await?;
    Ok(Json(response))
}
