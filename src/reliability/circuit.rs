//! Circuit breaker keyed by external resource.
//!
//! - **Closed**: calls pass through and failures are counted
//! - **Open**: calls are rejected until the open window passes
//! - **HalfOpen**: exactly one probe call is admitted; its outcome closes or
//!   reopens the circuit

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::SharedError;
use crate::redis_backend::RedisBackend;
use crate::routes::metrics::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open { retry_after_ms: u64 },
    HalfOpen,
}

/// Storage for per-resource circuit state.
#[async_trait]
pub trait CircuitTable: Send + Sync {
    async fn state(&self, resource: &str) -> Result<CircuitState, SharedError>;

    /// Claim the single half-open probe. False when another caller holds it.
    async fn try_claim_probe(&self, resource: &str, ttl: Duration) -> Result<bool, SharedError>;

    /// Count a failure; opens the circuit once `threshold` is reached.
    /// Returns true when this failure opened it.
    async fn record_failure(
        &self,
        resource: &str,
        threshold: u32,
        open_for: Duration,
    ) -> Result<bool, SharedError>;

    /// A failed probe puts the circuit straight back into the open state.
    async fn reopen(&self, resource: &str, open_for: Duration) -> Result<(), SharedError>;

    async fn record_success(&self, resource: &str) -> Result<(), SharedError>;
}

#[derive(Debug, Default)]
struct Entry {
    failures: u32,
    open_until: Option<Instant>,
    probe_until: Option<Instant>,
}

/// Process-local circuit table.
#[derive(Debug, Default)]
pub struct MemoryCircuitTable {
    entries: DashMap<String, Entry>,
}

impl MemoryCircuitTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failure_count(&self, resource: &str) -> u32 {
        self.entries.get(resource).map(|e| e.failures).unwrap_or(0)
    }

    fn state_local(&self, resource: &str) -> CircuitState {
        let Some(entry) = self.entries.get(resource) else {
            return CircuitState::Closed;
        };
        match entry.open_until {
            None => CircuitState::Closed,
            Some(until) => {
                let now = Instant::now();
                if until > now {
                    CircuitState::Open {
                        retry_after_ms: until.duration_since(now).as_millis() as u64,
                    }
                } else {
                    CircuitState::HalfOpen
                }
            }
        }
    }

    fn claim_local(&self, resource: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut entry = self.entries.entry(resource.to_string()).or_default();
        match entry.probe_until {
            Some(until) if until > now => false,
            _ => {
                entry.probe_until = Some(now + ttl);
                true
            }
        }
    }

    fn failure_local(&self, resource: &str, threshold: u32, open_for: Duration) -> bool {
        let mut entry = self.entries.entry(resource.to_string()).or_default();
        entry.failures += 1;
        if entry.open_until.is_none() && entry.failures >= threshold.max(1) {
            entry.open_until = Some(Instant::now() + open_for);
            entry.failures = 0;
            return true;
        }
        false
    }

    fn reopen_local(&self, resource: &str, open_for: Duration) {
        let mut entry = self.entries.entry(resource.to_string()).or_default();
        entry.open_until = Some(Instant::now() + open_for);
        entry.probe_until = None;
        entry.failures = 0;
    }

    fn success_local(&self, resource: &str) {
        self.entries.remove(resource);
    }
}

#[async_trait]
impl CircuitTable for MemoryCircuitTable {
    async fn state(&self, resource: &str) -> Result<CircuitState, SharedError> {
        Ok(self.state_local(resource))
    }

    async fn try_claim_probe(&self, resource: &str, ttl: Duration) -> Result<bool, SharedError> {
        Ok(self.claim_local(resource, ttl))
    }

    async fn record_failure(
        &self,
        resource: &str,
        threshold: u32,
        open_for: Duration,
    ) -> Result<bool, SharedError> {
        Ok(self.failure_local(resource, threshold, open_for))
    }

    async fn reopen(&self, resource: &str, open_for: Duration) -> Result<(), SharedError> {
        self.reopen_local(resource, open_for);
        Ok(())
    }

    async fn record_success(&self, resource: &str) -> Result<(), SharedError> {
        self.success_local(resource);
        Ok(())
    }
}

/// Cross-instance circuit table.
///
/// `cb:{r}:open` lives for the open window, `cb:{r}:tripped` marks a circuit
/// that needs a successful probe before it closes, and `cb:{r}:probe` is the
/// `SET NX` probe claim.
pub struct RedisCircuitTable {
    redis: RedisBackend,
}

impl RedisCircuitTable {
    pub fn new(redis: RedisBackend) -> Self {
        Self { redis }
    }

    fn key(resource: &str, part: &str) -> String {
        format!("cb:{}:{}", resource, part)
    }
}

#[async_trait]
impl CircuitTable for RedisCircuitTable {
    async fn state(&self, resource: &str) -> Result<CircuitState, SharedError> {
        if let Some(ms) = self.redis.pttl(&Self::key(resource, "open")).await? {
            return Ok(CircuitState::Open { retry_after_ms: ms });
        }
        if self.redis.get(&Self::key(resource, "tripped")).await?.is_some() {
            return Ok(CircuitState::HalfOpen);
        }
        Ok(CircuitState::Closed)
    }

    async fn try_claim_probe(&self, resource: &str, ttl: Duration) -> Result<bool, SharedError> {
        self.redis
            .set_nx_px(&Self::key(resource, "probe"), "1", ttl)
            .await
    }

    async fn record_failure(
        &self,
        resource: &str,
        threshold: u32,
        open_for: Duration,
    ) -> Result<bool, SharedError> {
        let failures = self.redis.incr(&Self::key(resource, "failures")).await?;
        if failures < threshold.max(1) as i64 {
            return Ok(false);
        }
        self.reopen(resource, open_for).await?;
        Ok(true)
    }

    async fn reopen(&self, resource: &str, open_for: Duration) -> Result<(), SharedError> {
        self.redis
            .set_px(&Self::key(resource, "open"), b"1", open_for)
            .await?;
        // tripped outlives the open window so the next caller sees half-open
        self.redis
            .set_px(&Self::key(resource, "tripped"), b"1", open_for * 10)
            .await?;
        self.redis.del(&Self::key(resource, "failures")).await?;
        self.redis.del(&Self::key(resource, "probe")).await
    }

    async fn record_success(&self, resource: &str) -> Result<(), SharedError> {
        for part in ["failures", "open", "tripped", "probe"] {
            self.redis.del(&Self::key(resource, part)).await?;
        }
        Ok(())
    }
}

/// Outcome of asking the breaker for permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub probe: bool,
    local: bool,
}

/// Breaker front end with shared/local fallback.
pub struct CircuitBreaker {
    shared: Option<Arc<dyn CircuitTable>>,
    local: Arc<MemoryCircuitTable>,
    threshold: u32,
    open_for: Duration,
    probe_ttl: Duration,
    metrics: Arc<Metrics>,
}

impl CircuitBreaker {
    pub fn new(
        shared: Option<Arc<dyn CircuitTable>>,
        threshold: u32,
        open_for: Duration,
        probe_ttl: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            shared,
            local: Arc::new(MemoryCircuitTable::new()),
            threshold,
            open_for,
            probe_ttl,
            metrics,
        }
    }

    pub fn local_table(&self) -> &MemoryCircuitTable {
        &self.local
    }

    /// Admit a call or return how long to wait before trying again.
    pub async fn admit(&self, resource: &str) -> Result<Admission, u64> {
        if let Some(shared) = &self.shared {
            match self.admit_with(shared.as_ref(), resource).await {
                Ok(result) => return result.map(|probe| Admission { probe, local: false }),
                Err(e) => {
                    warn!(error = %e, resource, "Shared circuit table unavailable, using local state");
                    self.metrics.inc_governor_fallbacks();
                }
            }
        }
        let probe = match self.local.state_local(resource) {
            CircuitState::Closed => false,
            CircuitState::Open { retry_after_ms } => return Err(retry_after_ms),
            CircuitState::HalfOpen => {
                if !self.local.claim_local(resource, self.probe_ttl) {
                    return Err(self.probe_ttl.as_millis() as u64);
                }
                true
            }
        };
        Ok(Admission { probe, local: true })
    }

    async fn admit_with(
        &self,
        table: &dyn CircuitTable,
        resource: &str,
    ) -> Result<Result<bool, u64>, SharedError> {
        Ok(match table.state(resource).await? {
            CircuitState::Closed => Ok(false),
            CircuitState::Open { retry_after_ms } => Err(retry_after_ms),
            CircuitState::HalfOpen => {
                if table.try_claim_probe(resource, self.probe_ttl).await? {
                    Ok(true)
                } else {
                    Err(self.probe_ttl.as_millis() as u64)
                }
            }
        })
    }

    fn table(&self, admission: Admission) -> &dyn CircuitTable {
        match (&self.shared, admission.local) {
            (Some(shared), false) => shared.as_ref(),
            _ => self.local.as_ref() as &dyn CircuitTable,
        }
    }

    pub async fn on_success(&self, resource: &str, admission: Admission) {
        if let Err(e) = self.table(admission).record_success(resource).await {
            warn!(error = %e, resource, "Failed to record circuit success");
        }
        if admission.probe {
            info!(resource, "Circuit closed after successful probe");
        }
    }

    pub async fn on_failure(&self, resource: &str, admission: Admission) {
        let table = self.table(admission);
        if admission.probe {
            if let Err(e) = table.reopen(resource, self.open_for).await {
                warn!(error = %e, resource, "Failed to reopen circuit");
            }
            warn!(resource, "Circuit reopened after failed probe");
            return;
        }
        match table
            .record_failure(resource, self.threshold, self.open_for)
            .await
        {
            Ok(true) => warn!(
                resource,
                threshold = self.threshold,
                "Circuit opened due to failures"
            ),
            Ok(false) => {}
            Err(e) => warn!(error = %e, resource, "Failed to record circuit failure"),
        }
    }
}
