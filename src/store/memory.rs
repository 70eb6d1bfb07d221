use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{CredentialStore, ResultStore};
use crate::error::StoreError;
use crate::models::{CacheEntry, CacheEntryKey, CallLogRecord, CredentialRecord, CredentialStatus};

#[derive(Debug, Clone, Default)]
pub struct MemoryResultStore {
    entries: Arc<RwLock<HashMap<CacheEntryKey, CacheEntry>>>,
    call_logs: Arc<RwLock<Vec<CallLogRecord>>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.read().len()
    }

    pub fn call_logs(&self) -> Vec<CallLogRecord> {
        self.call_logs.read().clone()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn find_entry(&self, key: &CacheEntryKey) -> Result<Option<CacheEntry>, StoreError> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn upsert_entry(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        self.entries
            .write()
            .insert(entry.key.clone(), entry.clone());
        Ok(())
    }

    async fn append_call_logs(&self, records: &[CallLogRecord]) -> Result<usize, StoreError> {
        self.call_logs.write().extend_from_slice(records);
        Ok(records.len())
    }

    async fn prune_call_logs(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut logs = self.call_logs.write();
        let before = logs.len();
        logs.retain(|r| r.created_at >= older_than);
        Ok((before - logs.len()) as u64)
    }

    async fn purge_expired_entries(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        Ok((before - entries.len()) as u64)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryCredentialStore {
    records: Arc<RwLock<HashMap<String, CredentialRecord>>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: CredentialRecord) {
        self.records.write().insert(record.tenant_id.clone(), record);
    }

    pub fn get(&self, tenant_id: &str) -> Option<CredentialRecord> {
        self.records.read().get(tenant_id).cloned()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self, tenant_id: &str) -> Result<Option<CredentialRecord>, StoreError> {
        Ok(self.get(tenant_id))
    }

    async fn save_tokens(
        &self,
        tenant_id: &str,
        access_token_enc: &str,
        refresh_token_enc: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut records = self.records.write();
        let record = records
            .get_mut(tenant_id)
            .ok_or_else(|| StoreError::Database(format!("no credential for {}", tenant_id)))?;
        record.access_token_enc = Some(access_token_enc.to_string());
        if let Some(refresh) = refresh_token_enc {
            record.refresh_token_enc = Some(refresh.to_string());
        }
        record.expires_at = Some(expires_at);
        record.status = CredentialStatus::Connected;
        record.last_error = None;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn set_status(
        &self,
        tenant_id: &str,
        status: CredentialStatus,
        last_error: Option<&str>,
    ) -> Result<(), StoreError> {
        if let Some(record) = self.records.write().get_mut(tenant_id) {
            record.status = status;
            record.last_error = last_error.map(str::to_string);
            record.updated_at = Utc::now();
        }
        Ok(())
    }
}
