//! Credential broker: hands out a valid access token per tenant.
//!
//! Tokens are decrypted on demand and refreshed when they are within the
//! expiry skew. Concurrent refreshes for one tenant collapse into a single
//! call to the identity provider.

pub mod cipher;
pub mod refresh;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

pub use cipher::{CipherError, TokenCipher};
pub use refresh::{OAuthRefresher, RefreshFailure, RefreshedToken, TokenRefresher};

use crate::config::CredentialConfig;
use crate::error::{QueryError, Result};
use crate::models::{CredentialRecord, CredentialStatus};
use crate::routes::metrics::Metrics;
use crate::store::CredentialStore;

/// A usable token plus the tenant's property selection.
#[derive(Debug, Clone)]
pub struct AccessGrant {
    pub access_token: String,
    pub selected_property_id: Option<String>,
}

type RefreshFuture = Shared<BoxFuture<'static, Result<String>>>;

struct InFlight {
    generation: u64,
    started: Instant,
    future: RefreshFuture,
}

#[derive(Clone)]
struct RefreshContext {
    store: Arc<dyn CredentialStore>,
    cipher: TokenCipher,
    refresher: Arc<dyn TokenRefresher>,
    expiry_skew: chrono::Duration,
    metrics: Arc<Metrics>,
}

pub struct CredentialBroker {
    ctx: RefreshContext,
    lock_ttl: Duration,
    inflight: Mutex<HashMap<String, InFlight>>,
    generation: AtomicU64,
}

impl CredentialBroker {
    pub fn new(
        config: &CredentialConfig,
        store: Arc<dyn CredentialStore>,
        cipher: TokenCipher,
        refresher: Arc<dyn TokenRefresher>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let expiry_skew = chrono::Duration::from_std(config.expiry_skew)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        Self {
            ctx: RefreshContext {
                store,
                cipher,
                refresher,
                expiry_skew,
                metrics,
            },
            lock_ttl: config.refresh_lock_ttl,
            inflight: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Return a valid access token for `tenant_id`, refreshing it if needed.
    pub async fn get_access_token(&self, tenant_id: &str) -> Result<AccessGrant> {
        let record = self
            .ctx
            .store
            .load(tenant_id)
            .await?
            .ok_or_else(|| QueryError::NotConnected {
                tenant_id: tenant_id.to_string(),
            })?;
        let selected_property_id = record.selected_property_id.clone();

        let access_token = match record.status {
            CredentialStatus::Disconnected => {
                return Err(QueryError::NotConnected {
                    tenant_id: tenant_id.to_string(),
                })
            }
            CredentialStatus::NeedsReconnect => {
                return Err(QueryError::ReauthRequired {
                    tenant_id: tenant_id.to_string(),
                    reason: record
                        .last_error
                        .unwrap_or_else(|| "reconnect required".to_string()),
                })
            }
            // a previous refresh failed transiently: try again rather than serve a stale token
            CredentialStatus::Error => self.refresh_once(tenant_id).await?,
            CredentialStatus::Connected => match self.ctx.usable_token(&record).await? {
                Some(token) => token,
                None => self.refresh_once(tenant_id).await?,
            },
        };

        Ok(AccessGrant {
            access_token,
            selected_property_id,
        })
    }

    /// The property the tenant currently has selected. No token work is done.
    pub async fn selected_property(&self, tenant_id: &str) -> Result<Option<String>> {
        let record = self
            .ctx
            .store
            .load(tenant_id)
            .await?
            .ok_or_else(|| QueryError::NotConnected {
                tenant_id: tenant_id.to_string(),
            })?;
        Ok(record.selected_property_id)
    }

    async fn refresh_once(&self, tenant_id: &str) -> Result<String> {
        let (generation, future) = {
            let mut inflight = self.inflight.lock();
            match inflight.get(tenant_id) {
                Some(entry) if entry.started.elapsed() < self.lock_ttl => {
                    (entry.generation, entry.future.clone())
                }
                _ => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                    let future = self
                        .ctx
                        .clone()
                        .refresh(tenant_id.to_string())
                        .boxed()
                        .shared();
                    inflight.insert(
                        tenant_id.to_string(),
                        InFlight {
                            generation,
                            started: Instant::now(),
                            future: future.clone(),
                        },
                    );
                    (generation, future)
                }
            }
        };

        let result = future.await;

        let mut inflight = self.inflight.lock();
        if inflight
            .get(tenant_id)
            .is_some_and(|entry| entry.generation == generation)
        {
            inflight.remove(tenant_id);
        }
        result
    }
}

impl RefreshContext {
    /// Decrypted access token if it is still outside the expiry skew.
    async fn usable_token(&self, record: &CredentialRecord) -> Result<Option<String>> {
        let (Some(enc), Some(expires_at)) = (&record.access_token_enc, record.expires_at) else {
            return Ok(None);
        };
        if expires_at <= Utc::now() + self.expiry_skew {
            return Ok(None);
        }
        match self.cipher.decrypt(enc) {
            Ok(token) => Ok(Some(token)),
            Err(e) => Err(self.reauth(&record.tenant_id, e.to_string()).await),
        }
    }

    async fn refresh(self, tenant_id: String) -> Result<String> {
        // another caller or instance may have refreshed since the first read
        let record = self
            .store
            .load(&tenant_id)
            .await?
            .ok_or_else(|| QueryError::NotConnected {
                tenant_id: tenant_id.clone(),
            })?;
        match record.status {
            CredentialStatus::Disconnected => {
                return Err(QueryError::NotConnected { tenant_id });
            }
            CredentialStatus::NeedsReconnect => {
                return Err(QueryError::ReauthRequired {
                    tenant_id,
                    reason: record
                        .last_error
                        .unwrap_or_else(|| "reconnect required".to_string()),
                });
            }
            CredentialStatus::Connected => {
                if let Some(token) = self.usable_token(&record).await? {
                    return Ok(token);
                }
            }
            CredentialStatus::Error => {}
        }

        let Some(refresh_enc) = record.refresh_token_enc.as_deref() else {
            return Err(self.reauth(&tenant_id, "no refresh token stored".into()).await);
        };
        let refresh_token = match self.cipher.decrypt(refresh_enc) {
            Ok(token) => token,
            Err(e) => return Err(self.reauth(&tenant_id, e.to_string()).await),
        };

        self.metrics.inc_token_refreshes();
        match self.refresher.refresh(&refresh_token).await {
            Ok(refreshed) => {
                let access_enc = self
                    .cipher
                    .encrypt(&refreshed.access_token)
                    .map_err(|e| QueryError::Internal(e.to_string()))?;
                let refresh_enc = refreshed
                    .refresh_token
                    .as_deref()
                    .map(|t| self.cipher.encrypt(t))
                    .transpose()
                    .map_err(|e| QueryError::Internal(e.to_string()))?;
                let lifetime = chrono::Duration::from_std(refreshed.expires_in)
                    .unwrap_or_else(|_| chrono::Duration::hours(1));

                self.store
                    .save_tokens(
                        &tenant_id,
                        &access_enc,
                        refresh_enc.as_deref(),
                        Utc::now() + lifetime,
                    )
                    .await?;
                info!(tenant_id = %tenant_id, "Refreshed access token");
                Ok(refreshed.access_token)
            }
            Err(failure) if failure.requires_reauth() => {
                Err(self.reauth(&tenant_id, failure.to_string()).await)
            }
            Err(failure) => {
                let reason = failure.to_string();
                warn!(tenant_id = %tenant_id, error = %reason, "Token refresh failed");
                self.store
                    .set_status(&tenant_id, CredentialStatus::Error, Some(&reason))
                    .await?;
                Err(QueryError::RefreshFailed { tenant_id, reason })
            }
        }
    }

    async fn reauth(&self, tenant_id: &str, reason: String) -> QueryError {
        warn!(tenant_id, reason = %reason, "Credential needs reconnect");
        if let Err(e) = self
            .store
            .set_status(tenant_id, CredentialStatus::NeedsReconnect, Some(&reason))
            .await
        {
            warn!(tenant_id, error = %e, "Failed to record credential status");
        }
        QueryError::ReauthRequired {
            tenant_id: tenant_id.to_string(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::MemoryCredentialStore;
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::sync::atomic::AtomicUsize;

    struct FakeRefresher {
        calls: AtomicUsize,
        outcome: Mutex<std::result::Result<RefreshedToken, RefreshFailure>>,
        delay: Duration,
    }

    impl FakeRefresher {
        fn ok(token: &str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                outcome: Mutex::new(Ok(RefreshedToken {
                    access_token: token.into(),
                    refresh_token: None,
                    expires_in: Duration::from_secs(3600),
                })),
                delay: Duration::from_millis(20),
            }
        }

        fn failing(code: &str) -> Self {
            let refresher = Self::ok("unused");
            *refresher.outcome.lock() = Err(RefreshFailure::Rejected {
                status: Some(400),
                code: code.into(),
                description: None,
            });
            refresher
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenRefresher for FakeRefresher {
        async fn refresh(
            &self,
            _refresh_token: &str,
        ) -> std::result::Result<RefreshedToken, RefreshFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.outcome.lock().clone()
        }
    }

    struct Fixture {
        store: MemoryCredentialStore,
        refresher: Arc<FakeRefresher>,
        broker: Arc<CredentialBroker>,
        cipher: TokenCipher,
    }

    fn fixture(refresher: FakeRefresher, expires_in: chrono::Duration) -> Fixture {
        let cipher = TokenCipher::ephemeral();
        let store = MemoryCredentialStore::new();
        store.insert(CredentialRecord {
            tenant_id: "t1".into(),
            status: CredentialStatus::Connected,
            access_token_enc: Some(cipher.encrypt("old-token").unwrap()),
            refresh_token_enc: Some(cipher.encrypt("refresh-token").unwrap()),
            expires_at: Some(Utc::now() + expires_in),
            selected_property_id: Some("123".into()),
            last_error: None,
            updated_at: Utc::now(),
        });
        let refresher = Arc::new(refresher);
        let broker = Arc::new(CredentialBroker::new(
            &CredentialConfig::default(),
            Arc::new(store.clone()),
            cipher.clone(),
            refresher.clone(),
            Arc::new(Metrics::new()),
        ));
        Fixture {
            store,
            refresher,
            broker,
            cipher,
        }
    }

    #[tokio::test]
    async fn fresh_token_is_served_without_refresh() {
        let f = fixture(FakeRefresher::ok("new"), chrono::Duration::hours(1));
        let grant = f.broker.get_access_token("t1").await.unwrap();
        assert_eq!(grant.access_token, "old-token");
        assert_eq!(grant.selected_property_id.as_deref(), Some("123"));
        assert_eq!(f.refresher.calls(), 0);
    }

    #[tokio::test]
    async fn token_inside_skew_is_refreshed_and_persisted() {
        let f = fixture(FakeRefresher::ok("new-token"), chrono::Duration::minutes(2));
        let grant = f.broker.get_access_token("t1").await.unwrap();
        assert_eq!(grant.access_token, "new-token");
        assert_eq!(f.refresher.calls(), 1);

        let record = f.store.get("t1").unwrap();
        assert_eq!(record.status, CredentialStatus::Connected);
        let stored = record.access_token_enc.unwrap();
        assert_ne!(stored, "new-token");
        assert_eq!(f.cipher.decrypt(&stored).unwrap(), "new-token");
    }

    #[tokio::test]
    async fn concurrent_refreshes_share_one_call() {
        let f = fixture(FakeRefresher::ok("new-token"), chrono::Duration::seconds(-10));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let broker = f.broker.clone();
            handles.push(tokio::spawn(async move {
                broker.get_access_token("t1").await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().access_token, "new-token");
        }
        assert_eq!(f.refresher.calls(), 1);
    }

    #[tokio::test]
    async fn invalid_grant_marks_reconnect_and_stops_refreshing() {
        let f = fixture(FakeRefresher::failing("invalid_grant"), chrono::Duration::seconds(-10));

        let err = f.broker.get_access_token("t1").await.unwrap_err();
        assert_eq!(err.code(), "REAUTH_REQUIRED");
        assert_eq!(f.store.get("t1").unwrap().status, CredentialStatus::NeedsReconnect);

        let err = f.broker.get_access_token("t1").await.unwrap_err();
        assert_eq!(err.code(), "REAUTH_REQUIRED");
        assert_eq!(f.refresher.calls(), 1);
    }

    #[tokio::test]
    async fn transient_failure_marks_error_and_retries_next_time() {
        let f = fixture(FakeRefresher::failing("server_error"), chrono::Duration::seconds(-10));

        let err = f.broker.get_access_token("t1").await.unwrap_err();
        assert_eq!(err.code(), "TOKEN_REFRESH_FAILED");
        assert_eq!(f.store.get("t1").unwrap().status, CredentialStatus::Error);

        *f.refresher.outcome.lock() = Ok(RefreshedToken {
            access_token: "healed".into(),
            refresh_token: Some("rotated".into()),
            expires_in: Duration::from_secs(3600),
        });
        let grant = f.broker.get_access_token("t1").await.unwrap();
        assert_eq!(grant.access_token, "healed");
        assert_eq!(f.refresher.calls(), 2);

        let record = f.store.get("t1").unwrap();
        assert_eq!(record.status, CredentialStatus::Connected);
        assert_eq!(
            f.cipher.decrypt(&record.refresh_token_enc.unwrap()).unwrap(),
            "rotated"
        );
    }

    #[tokio::test]
    async fn undecryptable_token_requires_reauth() {
        let f = fixture(FakeRefresher::ok("new"), chrono::Duration::hours(1));
        let mut record = f.store.get("t1").unwrap();
        record.access_token_enc = Some("bm90LWEtdG9rZW4tYXQtYWxs".into());
        f.store.insert(record);

        let err = f.broker.get_access_token("t1").await.unwrap_err();
        assert_eq!(err.code(), "REAUTH_REQUIRED");
        assert_eq!(f.store.get("t1").unwrap().status, CredentialStatus::NeedsReconnect);
    }

    #[tokio::test]
    async fn unknown_tenant_is_not_connected() {
        let f = fixture(FakeRefresher::ok("new"), chrono::Duration::hours(1));
        let err = f.broker.get_access_token("nobody").await.unwrap_err();
        assert_eq!(err.code(), "NOT_CONNECTED");
    }

    /// Serves one stale snapshot on the first load, then the live record.
    struct StaleFirstLoad {
        snapshot: Mutex<Option<CredentialRecord>>,
        inner: MemoryCredentialStore,
    }

    #[async_trait]
    impl CredentialStore for StaleFirstLoad {
        async fn load(
            &self,
            tenant_id: &str,
        ) -> std::result::Result<Option<CredentialRecord>, StoreError> {
            if let Some(stale) = self.snapshot.lock().take() {
                return Ok(Some(stale));
            }
            self.inner.load(tenant_id).await
        }

        async fn save_tokens(
            &self,
            tenant_id: &str,
            access_token_enc: &str,
            refresh_token_enc: Option<&str>,
            expires_at: DateTime<Utc>,
        ) -> std::result::Result<(), StoreError> {
            self.inner
                .save_tokens(tenant_id, access_token_enc, refresh_token_enc, expires_at)
                .await
        }

        async fn set_status(
            &self,
            tenant_id: &str,
            status: CredentialStatus,
            last_error: Option<&str>,
        ) -> std::result::Result<(), StoreError> {
            self.inner.set_status(tenant_id, status, last_error).await
        }
    }

    #[tokio::test]
    async fn revoked_since_first_read_fails_without_refreshing() {
        let f = fixture(FakeRefresher::ok("new-token"), chrono::Duration::seconds(-10));
        let stale = f.store.get("t1").unwrap();
        f.store
            .set_status("t1", CredentialStatus::NeedsReconnect, Some("invalid_grant"))
            .await
            .unwrap();

        let broker = CredentialBroker::new(
            &CredentialConfig::default(),
            Arc::new(StaleFirstLoad {
                snapshot: Mutex::new(Some(stale)),
                inner: f.store.clone(),
            }),
            f.cipher.clone(),
            f.refresher.clone(),
            Arc::new(Metrics::new()),
        );

        let err = broker.get_access_token("t1").await.unwrap_err();
        assert_eq!(err.code(), "REAUTH_REQUIRED");
        assert_eq!(f.refresher.calls(), 0);
        assert_eq!(f.store.get("t1").unwrap().status, CredentialStatus::NeedsReconnect);
    }

    #[tokio::test]
    async fn disconnected_since_first_read_is_not_connected() {
        let f = fixture(FakeRefresher::ok("new-token"), chrono::Duration::seconds(-10));
        let stale = f.store.get("t1").unwrap();
        f.store
            .set_status("t1", CredentialStatus::Disconnected, None)
            .await
            .unwrap();

        let broker = CredentialBroker::new(
            &CredentialConfig::default(),
            Arc::new(StaleFirstLoad {
                snapshot: Mutex::new(Some(stale)),
                inner: f.store.clone(),
            }),
            f.cipher.clone(),
            f.refresher.clone(),
            Arc::new(Metrics::new()),
        );

        let err = broker.get_access_token("t1").await.unwrap_err();
        assert_eq!(err.code(), "NOT_CONNECTED");
        assert_eq!(f.refresher.calls(), 0);
    }
}
