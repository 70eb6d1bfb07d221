//! Query error taxonomy and HTTP rendering

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;

/// Every error the query layer surfaces to its callers.
///
/// The set is closed: each variant maps to one machine-readable code and one
/// HTTP-equivalent status so the calling layer can render a specific message.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    /// Bad request shape, a configured bound exceeded, or unknown field names.
    #[error("Invalid request: {message}")]
    Validation {
        message: String,
        invalid_fields: Vec<String>,
    },

    #[error("Filter expression too complex (depth {depth}, nodes {nodes}; max depth {max_depth}, max nodes {max_nodes})")]
    FilterTooComplex {
        depth: usize,
        nodes: usize,
        max_depth: usize,
        max_nodes: usize,
    },

    #[error("Property {property_id} is not the selected property for this tenant")]
    PropertyNotSelected { property_id: String },

    #[error("Analytics account is not connected for tenant {tenant_id}")]
    NotConnected { tenant_id: String },

    /// The user has to reconnect the account; retrying will not help.
    #[error("Analytics account needs to be reconnected: {reason}")]
    ReauthRequired { tenant_id: String, reason: String },

    /// Token refresh failed for a reason that may heal on the next attempt.
    #[error("Token refresh failed: {reason}")]
    RefreshFailed { tenant_id: String, reason: String },

    #[error("Rate limit exceeded for {key}")]
    RateLimited { key: String, retry_after_ms: u64 },

    #[error("Provider circuit open for {resource}")]
    CircuitOpen { resource: String, retry_after_ms: u64 },

    #[error("Provider call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Provider error: {message}")]
    Provider {
        status: Option<u16>,
        reason: Option<String>,
        message: String,
        violations: Vec<String>,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using QueryError
pub type Result<T> = std::result::Result<T, QueryError>;

impl QueryError {
    pub fn validation(message: impl Into<String>) -> Self {
        QueryError::Validation {
            message: message.into(),
            invalid_fields: Vec::new(),
        }
    }

    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            QueryError::Validation { .. } => "VALIDATION",
            QueryError::FilterTooComplex { .. } => "FILTER_TOO_COMPLEX",
            QueryError::PropertyNotSelected { .. } => "PROPERTY_NOT_SELECTED",
            QueryError::NotConnected { .. } => "NOT_CONNECTED",
            QueryError::ReauthRequired { .. } => "REAUTH_REQUIRED",
            QueryError::RefreshFailed { .. } => "TOKEN_REFRESH_FAILED",
            QueryError::RateLimited { .. } => "RATE_LIMIT",
            QueryError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            QueryError::Timeout { .. } => "TIMEOUT",
            QueryError::Provider { .. } => "PROVIDER_ERROR",
            QueryError::Internal(_) => "INTERNAL",
        }
    }

    /// HTTP-equivalent status.
    pub fn status(&self) -> StatusCode {
        match self {
            QueryError::Validation { .. }
            | QueryError::FilterTooComplex { .. }
            | QueryError::PropertyNotSelected { .. } => StatusCode::BAD_REQUEST,
            QueryError::NotConnected { .. } => StatusCode::CONFLICT,
            QueryError::ReauthRequired { .. } | QueryError::RefreshFailed { .. } => {
                StatusCode::UNAUTHORIZED
            }
            QueryError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            QueryError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            QueryError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            QueryError::Provider { status, .. } => match status {
                Some(429) => StatusCode::TOO_MANY_REQUESTS,
                Some(code @ 400..=499) => {
                    StatusCode::from_u16(*code).unwrap_or(StatusCode::BAD_REQUEST)
                }
                _ => StatusCode::BAD_GATEWAY,
            },
            QueryError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Variant-specific diagnostic fields.
    pub fn details(&self) -> Value {
        match self {
            QueryError::Validation { invalid_fields, .. } => {
                json!({ "invalidFields": invalid_fields })
            }
            QueryError::FilterTooComplex {
                depth,
                nodes,
                max_depth,
                max_nodes,
            } => json!({
                "depth": depth,
                "nodes": nodes,
                "maxDepth": max_depth,
                "maxNodes": max_nodes,
            }),
            QueryError::PropertyNotSelected { property_id } => {
                json!({ "propertyId": property_id })
            }
            QueryError::NotConnected { tenant_id } => json!({ "tenantId": tenant_id }),
            QueryError::ReauthRequired { tenant_id, reason }
            | QueryError::RefreshFailed { tenant_id, reason } => {
                json!({ "tenantId": tenant_id, "reason": reason })
            }
            QueryError::RateLimited { retry_after_ms, .. }
            | QueryError::CircuitOpen { retry_after_ms, .. } => {
                json!({ "retryAfterMs": retry_after_ms })
            }
            QueryError::Timeout { timeout_ms } => json!({ "timeoutMs": timeout_ms }),
            QueryError::Provider {
                status,
                reason,
                violations,
                ..
            } => json!({
                "providerStatus": status,
                "reason": reason,
                "violations": violations,
            }),
            QueryError::Internal(_) => Value::Null,
        }
    }

    /// Credential problems never reach the circuit breaker.
    pub fn is_credential_error(&self) -> bool {
        matches!(
            self,
            QueryError::NotConnected { .. }
                | QueryError::ReauthRequired { .. }
                | QueryError::RefreshFailed { .. }
        )
    }
}

impl IntoResponse for QueryError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": self.to_string(),
            "code": self.code(),
            "status": status.as_u16(),
            "details": self.details(),
        }));

        (status, body).into_response()
    }
}

impl From<serde_json::Error> for QueryError {
    fn from(err: serde_json::Error) -> Self {
        QueryError::validation(err.to_string())
    }
}

/// Errors from the persistent store (Postgres or in-memory).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialisation error: {0}")]
    Serialisation(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialisation(err.to_string())
    }
}

impl From<StoreError> for QueryError {
    fn from(err: StoreError) -> Self {
        QueryError::Internal(err.to_string())
    }
}

/// Errors from a shared (cross-instance) backend such as Redis.
#[derive(Debug, Error)]
pub enum SharedError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Backend error: {0}")]
    Backend(String),
}
