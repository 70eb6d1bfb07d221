//! Analytics provider seam.
//!
//! The orchestrator only talks to [`AnalyticsProvider`]; [`http`] implements
//! it against the Data API over HTTPS.

pub mod http;

use async_trait::async_trait;
use thiserror::Error;

pub use http::HttpProvider;

use crate::error::QueryError;
use crate::models::{
    CompatibilityPayload, CompatibilityVerdict, MetadataSchema, RealtimePayload, ReportData,
    ReportPayload,
};
use crate::reliability::{ErrorClass, ReliabilityError};

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// `timeout_ms` is the client deadline that elapsed, if that was the cause.
    #[error("Provider unreachable: {message}")]
    Transport {
        message: String,
        timeout_ms: Option<u64>,
    },

    #[error("Provider returned {status}: {message}")]
    Http {
        status: u16,
        reason: Option<String>,
        message: String,
        violations: Vec<String>,
    },

    #[error("Unexpected provider response: {0}")]
    Decode(String),
}

#[async_trait]
pub trait AnalyticsProvider: Send + Sync {
    async fn run_report(
        &self,
        access_token: &str,
        property_id: &str,
        request: &ReportPayload,
    ) -> Result<ReportData, ProviderError>;

    async fn run_realtime_report(
        &self,
        access_token: &str,
        property_id: &str,
        request: &RealtimePayload,
    ) -> Result<ReportData, ProviderError>;

    async fn batch_run_reports(
        &self,
        access_token: &str,
        property_id: &str,
        requests: &[ReportPayload],
    ) -> Result<Vec<ReportData>, ProviderError>;

    async fn check_compatibility(
        &self,
        access_token: &str,
        property_id: &str,
        request: &CompatibilityPayload,
    ) -> Result<CompatibilityVerdict, ProviderError>;

    async fn get_metadata(
        &self,
        access_token: &str,
        property_id: &str,
    ) -> Result<MetadataSchema, ProviderError>;
}

/// Default retry policy for provider calls.
pub fn classify(error: &ProviderError) -> ErrorClass {
    match error {
        ProviderError::Transport { .. } => ErrorClass::Transient,
        ProviderError::Http { status, .. } => match status {
            429 | 500 | 502 | 503 | 504 => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        },
        ProviderError::Decode(_) => ErrorClass::Fatal,
    }
}

impl From<ProviderError> for QueryError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Http {
                status,
                reason,
                message,
                violations,
            } => QueryError::Provider {
                status: Some(status),
                reason,
                message,
                violations,
            },
            ProviderError::Transport {
                timeout_ms: Some(timeout_ms),
                ..
            } => QueryError::Timeout { timeout_ms },
            ProviderError::Transport { message, .. } | ProviderError::Decode(message) => {
                QueryError::Provider {
                    status: None,
                    reason: None,
                    message,
                    violations: Vec::new(),
                }
            }
        }
    }
}

impl From<ReliabilityError<ProviderError>> for QueryError {
    fn from(err: ReliabilityError<ProviderError>) -> Self {
        match err {
            ReliabilityError::CircuitOpen {
                resource,
                retry_after_ms,
            } => QueryError::CircuitOpen {
                resource,
                retry_after_ms,
            },
            ReliabilityError::Timeout { timeout_ms } => QueryError::Timeout { timeout_ms },
            ReliabilityError::Failed(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http(status: u16) -> ProviderError {
        ProviderError::Http {
            status,
            reason: None,
            message: "x".into(),
            violations: vec![],
        }
    }

    #[test]
    fn retryable_statuses() {
        for status in [429, 500, 502, 503, 504] {
            assert_eq!(classify(&http(status)), ErrorClass::Transient, "{}", status);
        }
        assert_eq!(
            classify(&ProviderError::Transport {
                message: "reset".into(),
                timeout_ms: None
            }),
            ErrorClass::Transient
        );
    }

    #[test]
    fn client_errors_are_not_retried() {
        assert_eq!(classify(&http(400)), ErrorClass::Fatal);
        assert_eq!(classify(&http(403)), ErrorClass::Fatal);
        assert_eq!(classify(&http(501)), ErrorClass::Fatal);
    }

    #[test]
    fn client_timeouts_map_to_timeout() {
        let err: QueryError = ReliabilityError::Failed(ProviderError::Transport {
            message: "operation timed out".into(),
            timeout_ms: Some(10_000),
        })
        .into();
        assert_eq!(err.code(), "TIMEOUT");

        let err: QueryError = ProviderError::Transport {
            message: "connection refused".into(),
            timeout_ms: None,
        }
        .into();
        assert_eq!(err.code(), "PROVIDER_ERROR");
    }

    #[test]
    fn reliability_errors_map_to_query_errors() {
        let err: QueryError = ReliabilityError::<ProviderError>::Timeout { timeout_ms: 30_000 }.into();
        assert_eq!(err.code(), "TIMEOUT");

        let err: QueryError = ReliabilityError::Failed(http(503)).into();
        match err {
            QueryError::Provider { status, .. } => assert_eq!(status, Some(503)),
            other => panic!("unexpected {:?}", other),
        }
    }
}
