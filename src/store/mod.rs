//! Persistent-store seams.
//!
//! The query layer only needs a handful of operations from its durable
//! store. Postgres implements them in [`crate::db`]; [`memory`] backs local
//! runs and tests.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::models::{CacheEntry, CacheEntryKey, CallLogRecord, CredentialRecord, CredentialStatus};

pub use memory::{MemoryCredentialStore, MemoryResultStore};

/// Cross-instance cache rows and the append-only call log.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Raw lookup. Callers must still compare `expires_at` against the clock.
    async fn find_entry(&self, key: &CacheEntryKey) -> Result<Option<CacheEntry>, StoreError>;

    async fn upsert_entry(&self, entry: &CacheEntry) -> Result<(), StoreError>;

    async fn append_call_logs(&self, records: &[CallLogRecord]) -> Result<usize, StoreError>;

    async fn prune_call_logs(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn purge_expired_entries(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Per-tenant credential record.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self, tenant_id: &str) -> Result<Option<CredentialRecord>, StoreError>;

    async fn save_tokens(
        &self,
        tenant_id: &str,
        access_token_enc: &str,
        refresh_token_enc: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn set_status(
        &self,
        tenant_id: &str,
        status: CredentialStatus,
        last_error: Option<&str>,
    ) -> Result<(), StoreError>;
}
