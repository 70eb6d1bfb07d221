//! Bounded parallelism per external resource.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::SharedError;
use crate::redis_backend::RedisBackend;
use crate::routes::metrics::Metrics;

/// Counting table behind [`ConcurrencyLimiter`].
#[async_trait]
pub trait SlotTable: Send + Sync {
    /// Wait until a slot for `key` is held.
    async fn acquire(&self, key: &str) -> Result<(), SharedError>;

    async fn release(&self, key: &str) -> Result<(), SharedError>;
}

#[derive(Default)]
struct SlotState {
    active: u32,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// Exact, FIFO, single-process slots.
pub struct LocalSlots {
    max: u32,
    state: Mutex<HashMap<String, SlotState>>,
}

impl LocalSlots {
    pub fn new(max: u32) -> Self {
        Self {
            max: max.max(1),
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn active(&self, key: &str) -> u32 {
        self.state.lock().get(key).map(|s| s.active).unwrap_or(0)
    }

    pub fn waiting(&self, key: &str) -> usize {
        self.state.lock().get(key).map(|s| s.waiters.len()).unwrap_or(0)
    }

    async fn acquire_local(&self, key: &str) {
        loop {
            let rx = {
                let mut state = self.state.lock();
                let slot = state.entry(key.to_string()).or_default();
                if slot.active < self.max && slot.waiters.is_empty() {
                    slot.active += 1;
                    return;
                }
                let (tx, rx) = oneshot::channel();
                slot.waiters.push_back(tx);
                rx
            };
            let mut ticket = WaitTicket {
                slots: self,
                key,
                rx,
                settled: false,
            };
            // a handed-off slot arrives as Ok; a dropped sender means try again
            let handed = (&mut ticket.rx).await.is_ok();
            ticket.settled = true;
            if handed {
                return;
            }
        }
    }

    /// Drop queued waiters whose receiver is gone.
    fn forget_closed(&self, key: &str) {
        let mut state = self.state.lock();
        let Some(slot) = state.get_mut(key) else {
            return;
        };
        slot.waiters.retain(|w| !w.is_closed());
        if slot.active == 0 && slot.waiters.is_empty() {
            state.remove(key);
        }
    }

    fn release_local(&self, key: &str) {
        let mut state = self.state.lock();
        let Some(slot) = state.get_mut(key) else {
            return;
        };
        while let Some(waiter) = slot.waiters.pop_front() {
            if waiter.send(()).is_ok() {
                return;
            }
        }
        slot.active = slot.active.saturating_sub(1);
        if slot.active == 0 {
            state.remove(key);
        }
    }
}

/// A queued waiter. Dropped before settling (the acquiring future was
/// cancelled), it passes on any slot already handed to it.
struct WaitTicket<'a> {
    slots: &'a LocalSlots,
    key: &'a str,
    rx: oneshot::Receiver<()>,
    settled: bool,
}

impl Drop for WaitTicket<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            self.slots.release_local(self.key);
        } else {
            self.slots.forget_closed(self.key);
        }
    }
}

#[async_trait]
impl SlotTable for LocalSlots {
    async fn acquire(&self, key: &str) -> Result<(), SharedError> {
        self.acquire_local(key).await;
        Ok(())
    }

    async fn release(&self, key: &str) -> Result<(), SharedError> {
        self.release_local(key);
        Ok(())
    }
}

/// Approximate cross-instance semaphore built on `INCR` / `DECR`.
///
/// Brief overshoot is possible; the counter key expires after `slot_ttl` so
/// a crashed holder cannot wedge the resource forever.
pub struct RedisSlots {
    redis: RedisBackend,
    max: u32,
    poll: Duration,
    slot_ttl: Duration,
}

impl RedisSlots {
    pub fn new(redis: RedisBackend, max: u32, poll: Duration, slot_ttl: Duration) -> Self {
        Self {
            redis,
            max: max.max(1),
            poll,
            slot_ttl,
        }
    }
}

#[async_trait]
impl SlotTable for RedisSlots {
    async fn acquire(&self, key: &str) -> Result<(), SharedError> {
        let deadline = Instant::now() + self.slot_ttl;
        loop {
            let count = self.redis.incr(key).await?;
            self.redis.pexpire(key, self.slot_ttl).await?;
            if count <= self.max as i64 {
                return Ok(());
            }
            self.redis.decr(key).await?;
            if Instant::now() >= deadline {
                warn!(key, "Gave up waiting for a shared slot; proceeding over the cap");
                self.redis.incr(key).await?;
                return Ok(());
            }
            tokio::time::sleep(self.poll).await;
        }
    }

    async fn release(&self, key: &str) -> Result<(), SharedError> {
        let count = self.redis.decr(key).await?;
        if count < 0 {
            self.redis.del(key).await?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lease {
    Shared,
    Local,
}

/// `with_limit` front end: shared table when available, local table otherwise.
pub struct ConcurrencyLimiter {
    shared: Option<Arc<dyn SlotTable>>,
    local: Arc<LocalSlots>,
    metrics: Arc<Metrics>,
}

impl ConcurrencyLimiter {
    pub fn new(shared: Option<Arc<dyn SlotTable>>, local: Arc<LocalSlots>, metrics: Arc<Metrics>) -> Self {
        Self {
            shared,
            local,
            metrics,
        }
    }

    /// Run `task` while holding a slot for `key`. The slot is released
    /// whether the task finishes, fails or is dropped.
    pub async fn with_limit<F, T>(&self, key: &str, task: F) -> T
    where
        F: Future<Output = T> + Send,
    {
        let guard = self.acquire(key).await;
        let out = task.await;
        guard.release().await;
        out
    }

    /// Wait for a slot for `key`, held until the guard is released or dropped.
    pub async fn acquire(&self, key: &str) -> SlotGuard {
        let lease = self.acquire_lease(key).await;
        SlotGuard {
            key: key.to_string(),
            lease: Some(lease),
            local: self.local.clone(),
            shared: self.shared.clone(),
            metrics: self.metrics.clone(),
        }
    }

    async fn acquire_lease(&self, key: &str) -> Lease {
        if let Some(shared) = &self.shared {
            match shared.acquire(key).await {
                Ok(()) => return Lease::Shared,
                Err(e) => {
                    warn!(error = %e, key, "Shared concurrency table unavailable, using local slots");
                    self.metrics.inc_governor_fallbacks();
                }
            }
        }
        self.local.acquire_local(key).await;
        Lease::Local
    }
}

/// A held concurrency slot.
///
/// Local slots are returned synchronously on drop; a shared slot dropped
/// without [`SlotGuard::release`] is returned from a spawned task.
pub struct SlotGuard {
    key: String,
    lease: Option<Lease>,
    local: Arc<LocalSlots>,
    shared: Option<Arc<dyn SlotTable>>,
    metrics: Arc<Metrics>,
}

impl SlotGuard {
    pub async fn release(mut self) {
        if self.lease == Some(Lease::Shared) {
            self.lease = None;
            if let Some(shared) = self.shared.clone() {
                release_shared(shared.as_ref(), &self.key, &self.metrics).await;
            }
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        match self.lease.take() {
            Some(Lease::Local) => self.local.release_local(&self.key),
            Some(Lease::Shared) => {
                let Some(shared) = self.shared.clone() else {
                    return;
                };
                let Ok(handle) = tokio::runtime::Handle::try_current() else {
                    // the counter key's TTL reclaims the slot
                    return;
                };
                let key = std::mem::take(&mut self.key);
                let metrics = self.metrics.clone();
                handle.spawn(async move {
                    release_shared(shared.as_ref(), &key, &metrics).await;
                });
            }
            None => {}
        }
    }
}

async fn release_shared(shared: &dyn SlotTable, key: &str, metrics: &Metrics) {
    if let Err(e) = shared.release(key).await {
        // the counter key's TTL reclaims the slot
        debug!(error = %e, key, "Failed to release shared slot");
        metrics.inc_governor_fallbacks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct DownTable;

    #[async_trait]
    impl SlotTable for DownTable {
        async fn acquire(&self, _key: &str) -> Result<(), SharedError> {
            Err(SharedError::Connection("refused".into()))
        }

        async fn release(&self, _key: &str) -> Result<(), SharedError> {
            Err(SharedError::Connection("refused".into()))
        }
    }

    fn limiter(max: u32, shared: Option<Arc<dyn SlotTable>>) -> (Arc<ConcurrencyLimiter>, Arc<LocalSlots>) {
        let local = Arc::new(LocalSlots::new(max));
        (
            Arc::new(ConcurrencyLimiter::new(shared, local.clone(), Arc::new(Metrics::new()))),
            local,
        )
    }

    #[tokio::test]
    async fn never_exceeds_cap() {
        let (limiter, _) = limiter(2, None);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = limiter.clone();
            let running = running.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .with_limit("property:1", async {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn waiters_are_served_in_order() {
        let local = Arc::new(LocalSlots::new(1));
        local.acquire_local("k").await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3 {
            let task_local = local.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                task_local.acquire_local("k").await;
                order.lock().push(i);
                task_local.release_local("k");
            }));
            // let each task enqueue before the next one starts
            while local.waiting("k") < i + 1 {
                tokio::task::yield_now().await;
            }
        }

        local.release_local("k");
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert_eq!(local.active("k"), 0);
    }

    #[tokio::test]
    async fn slot_released_on_task_error() {
        let (limiter, local) = limiter(1, None);
        let result: Result<(), &str> = limiter.with_limit("k", async { Err("boom") }).await;
        assert!(result.is_err());
        assert_eq!(local.active("k"), 0);
    }

    #[tokio::test]
    async fn shared_outage_degrades_to_local() {
        let (limiter, local) = limiter(1, Some(Arc::new(DownTable)));
        let value = limiter
            .with_limit("k", async {
                assert_eq!(local.active("k"), 1);
                7
            })
            .await;
        assert_eq!(value, 7);
        assert_eq!(local.active("k"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_holder_returns_its_slot() {
        let (limiter, local) = limiter(1, None);

        let cancelled = tokio::time::timeout(
            Duration::from_millis(10),
            limiter.with_limit("property:1", tokio::time::sleep(Duration::from_secs(5))),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(local.active("property:1"), 0);

        let next = tokio::time::timeout(
            Duration::from_millis(200),
            limiter.with_limit("property:1", async { 1 }),
        )
        .await;
        assert_eq!(next.ok(), Some(1));
    }

    #[tokio::test]
    async fn cancelled_waiter_passes_on_a_handed_slot() {
        let (limiter, local) = limiter(1, None);
        let holder = limiter.acquire("k").await;

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.with_limit("k", std::future::pending::<()>()).await })
        };
        while local.waiting("k") < 1 {
            tokio::task::yield_now().await;
        }

        // hand the slot to the waiter, then cancel it before it runs
        drop(holder);
        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());

        assert_eq!(local.active("k"), 0);
        assert_eq!(local.waiting("k"), 0);
        assert_eq!(limiter.with_limit("k", async { 2 }).await, 2);
    }

    #[tokio::test]
    async fn cancelled_waiter_leaves_the_queue() {
        let (limiter, local) = limiter(1, None);
        let holder = limiter.acquire("k").await;

        let waiting = tokio::time::timeout(
            Duration::from_millis(5),
            limiter.with_limit("k", async {}),
        )
        .await;
        assert!(waiting.is_err());
        assert_eq!(local.waiting("k"), 0);

        holder.release().await;
        assert_eq!(local.active("k"), 0);
    }
}
