//! Database access layer with SQLx and PostgreSQL

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::time::Duration;
use tracing::{error, info};

use crate::error::StoreError;
use crate::models::{CacheEntry, CacheEntryKey, CallLogRecord, CredentialRecord, CredentialStatus};
use crate::store::{CredentialStore, ResultStore};

/// Database connection pool and operations
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool
    pub async fn new(connection_string: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(600))
            .connect(connection_string)
            .await
            .map_err(|e| StoreError::Database(format!("Failed to connect: {}", e)))?;

        info!("Database connection pool established");
        Ok(Self { pool })
    }

    /// Apply pending migrations from `migrations/`
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    /// Get the underlying connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ResultStore for Database {
    async fn find_entry(&self, key: &CacheEntryKey) -> Result<Option<CacheEntry>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT request, response, expires_at
            FROM analytics_cache_entries
            WHERE tenant_id = $1 AND property_id = $2 AND kind = $3 AND request_hash = $4
            "#,
        )
        .bind(&key.tenant_id)
        .bind(&key.property_id)
        .bind(key.kind.as_str())
        .bind(&key.request_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| CacheEntry {
            key: key.clone(),
            request: row.get("request"),
            response: row.get("response"),
            expires_at: row.get("expires_at"),
        }))
    }

    async fn upsert_entry(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO analytics_cache_entries (
                tenant_id, property_id, kind, request_hash, request, response, expires_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (tenant_id, property_id, kind, request_hash)
            DO UPDATE SET request = EXCLUDED.request,
                          response = EXCLUDED.response,
                          expires_at = EXCLUDED.expires_at,
                          created_at = NOW()
            "#,
        )
        .bind(&entry.key.tenant_id)
        .bind(&entry.key.property_id)
        .bind(entry.key.kind.as_str())
        .bind(&entry.key.request_hash)
        .bind(&entry.request)
        .bind(&entry.response)
        .bind(entry.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Batch insert call logs. Individual row failures are logged and skipped.
    async fn append_call_logs(&self, records: &[CallLogRecord]) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for record in records {
            match sqlx::query(
                r#"
                INSERT INTO analytics_call_logs (
                    id, tenant_id, property_id, kind, request_hash,
                    request, response, http_status, error, duration_ms, created_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(record.id)
            .bind(&record.tenant_id)
            .bind(&record.property_id)
            .bind(record.kind.as_str())
            .bind(&record.request_hash)
            .bind(&record.request)
            .bind(&record.response)
            .bind(record.http_status)
            .bind(&record.error)
            .bind(record.duration_ms as i64)
            .bind(record.created_at)
            .execute(&mut *tx)
            .await
            {
                Ok(_) => inserted += 1,
                Err(e) => {
                    error!(error = %e, call_log_id = %record.id, "Failed to insert call log");
                }
            }
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn prune_call_logs(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM analytics_call_logs WHERE created_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn purge_expired_entries(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM analytics_cache_entries WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl CredentialStore for Database {
    async fn load(&self, tenant_id: &str) -> Result<Option<CredentialRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT tenant_id, status, access_token_enc, refresh_token_enc, expires_at,
                   selected_property_id, last_error, updated_at
            FROM analytics_credentials
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| CredentialRecord {
            tenant_id: row.get("tenant_id"),
            status: CredentialStatus::parse(row.get::<String, _>("status").as_str()),
            access_token_enc: row.get("access_token_enc"),
            refresh_token_enc: row.get("refresh_token_enc"),
            expires_at: row.get("expires_at"),
            selected_property_id: row.get("selected_property_id"),
            last_error: row.get("last_error"),
            updated_at: row.get("updated_at"),
        }))
    }

    async fn save_tokens(
        &self,
        tenant_id: &str,
        access_token_enc: &str,
        refresh_token_enc: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE analytics_credentials
            SET access_token_enc = $2,
                refresh_token_enc = COALESCE($3, refresh_token_enc),
                expires_at = $4,
                status = 'CONNECTED',
                last_error = NULL,
                updated_at = NOW()
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id)
        .bind(access_token_enc)
        .bind(refresh_token_enc)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_status(
        &self,
        tenant_id: &str,
        status: CredentialStatus,
        last_error: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE analytics_credentials
            SET status = $2, last_error = $3, updated_at = NOW()
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id)
        .bind(status.as_str())
        .bind(last_error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
