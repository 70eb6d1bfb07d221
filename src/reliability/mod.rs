//! Reliability executor: circuit check, per-attempt timeout, classified
//! retries with exponential backoff and jitter.

pub mod circuit;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

pub use circuit::{
    Admission, CircuitBreaker, CircuitState, CircuitTable, MemoryCircuitTable, RedisCircuitTable,
};

use crate::config::ReliabilityConfig;
use crate::routes::metrics::Metrics;

/// How a failed attempt is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying; counts toward the circuit once retries are exhausted.
    Transient,
    /// Not retried; counts toward the circuit.
    Fatal,
}

#[derive(Debug, Error)]
pub enum ReliabilityError<E> {
    #[error("Circuit open for {resource}")]
    CircuitOpen { resource: String, retry_after_ms: u64 },

    #[error("Timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("{0}")]
    Failed(E),
}

/// Delay before retry number `attempt` (1-based: the delay after the first failure).
pub fn backoff_delay(config: &ReliabilityConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let base = config.base_backoff.saturating_mul(1u32 << exp);
    let jitter_ms = config.jitter.as_millis() as u64;
    let jitter = if jitter_ms == 0 {
        0
    } else {
        rand::random_range(0..=jitter_ms)
    };
    base.min(config.max_backoff) + Duration::from_millis(jitter)
}

pub struct Executor {
    config: ReliabilityConfig,
    circuit: CircuitBreaker,
    metrics: Arc<Metrics>,
}

impl Executor {
    pub fn new(
        config: ReliabilityConfig,
        circuit_table: Option<Arc<dyn CircuitTable>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        // a probe may legitimately take every attempt
        let probe_ttl = config.timeout.saturating_mul(config.max_attempts.max(1));
        let circuit = CircuitBreaker::new(
            circuit_table,
            config.failure_threshold,
            config.open_duration,
            probe_ttl,
            metrics.clone(),
        );
        Self {
            config,
            circuit,
            metrics,
        }
    }

    pub fn config(&self) -> &ReliabilityConfig {
        &self.config
    }

    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    /// Run `task` against `resource`. `task` receives the 1-based attempt number.
    ///
    /// The circuit is consulted once per call and updated once per call, so a
    /// call that exhausts its retries counts as a single failure.
    pub async fn execute<T, E, F, Fut, C>(
        &self,
        resource: &str,
        classify: C,
        mut task: F,
    ) -> Result<T, ReliabilityError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> ErrorClass,
        E: std::fmt::Display,
    {
        let admission = match self.circuit.admit(resource).await {
            Ok(admission) => admission,
            Err(retry_after_ms) => {
                self.metrics.inc_circuit_rejections();
                return Err(ReliabilityError::CircuitOpen {
                    resource: resource.to_string(),
                    retry_after_ms,
                });
            }
        };

        let max_attempts = self.config.max_attempts.max(1);
        let timeout_ms = self.config.timeout.as_millis() as u64;
        let mut attempt = 0;

        let (error, class) = loop {
            attempt += 1;
            self.metrics.inc_live_calls();
            if attempt > 1 {
                self.metrics.inc_retries();
            }

            let (error, class) = match tokio::time::timeout(self.config.timeout, task(attempt)).await {
                Ok(Ok(value)) => {
                    self.circuit.on_success(resource, admission).await;
                    return Ok(value);
                }
                Ok(Err(e)) => {
                    let class = classify(&e);
                    (ReliabilityError::Failed(e), class)
                }
                Err(_) => (ReliabilityError::Timeout { timeout_ms }, ErrorClass::Transient),
            };

            if class != ErrorClass::Transient || attempt >= max_attempts {
                break (error, class);
            }

            let delay = backoff_delay(&self.config, attempt);
            debug!(
                resource,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying provider call"
            );
            tokio::time::sleep(delay).await;
        };

        warn!(
            resource,
            attempts = attempt,
            class = ?class,
            error = %error,
            "Provider call failed"
        );
        self.metrics.inc_provider_errors();
        self.circuit.on_failure(resource, admission).await;
        Err(error)
    }
}
