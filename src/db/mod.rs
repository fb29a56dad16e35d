pub mod models;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::crypto::SecretCipher;
use crate::db::models::{
    normalize_operations, CreateEndpoint, EndpointProfile, EndpointRow, EndpointStatus,
    UpdateEndpoint,
};
use crate::error::{GatewayError, GatewayResult};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Durable store of endpoint profiles. Secrets pass through the cipher on
/// the way in and are never decrypted here.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    cipher: Arc<SecretCipher>,
}

impl Database {
    pub async fn open(db_path: &Path, cipher: Arc<SecretCipher>) -> Result<Self> {
        let db_url = format!("sqlite://{}", db_path.display());

        tracing::info!("Connecting to database: {}", db_url);

        // Writers queue on the lock instead of failing with SQLITE_BUSY.
        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        Self::run_migrations(&pool).await?;

        Ok(Self { pool, cipher })
    }

    #[cfg(test)]
    pub async fn in_memory(cipher: Arc<SecretCipher>) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        Self::run_migrations(&pool).await?;

        Ok(Self { pool, cipher })
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<()> {
        tracing::info!("Running database migrations...");

        let migration_001 = include_str!("../../migrations/001_init.sql");
        sqlx::raw_sql(migration_001)
            .execute(pool)
            .await
            .context("Failed to run migration 001")?;

        tracing::info!("Migrations completed successfully");
        Ok(())
    }

    pub fn cipher(&self) -> &SecretCipher {
        &self.cipher
    }

    /// Newest first.
    pub async fn get_endpoints(&self) -> GatewayResult<Vec<EndpointProfile>> {
        let rows = sqlx::query_as::<_, EndpointRow>(
            "SELECT * FROM api_endpoints ORDER BY created_at DESC, rowid DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EndpointProfile::try_from).collect()
    }

    pub async fn get_endpoint(&self, id: &str) -> GatewayResult<Option<EndpointProfile>> {
        let row = sqlx::query_as::<_, EndpointRow>("SELECT * FROM api_endpoints WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(EndpointProfile::try_from).transpose()
    }

    pub async fn find_endpoint(&self, id: &str) -> GatewayResult<EndpointProfile> {
        self.get_endpoint(id)
            .await?
            .ok_or_else(|| endpoint_not_found(id))
    }

    pub async fn create_endpoint(
        &self,
        endpoint: CreateEndpoint,
        created_by: &str,
    ) -> GatewayResult<EndpointProfile> {
        endpoint.validate()?;

        let secret = match endpoint.auth.secret() {
            Some(plaintext) => Some(self.cipher.encrypt(plaintext)?),
            None => None,
        };
        let now = Utc::now();
        let profile = EndpointProfile {
            id: uuid::Uuid::new_v4().to_string(),
            name: endpoint.name.clone(),
            description: endpoint.description.clone(),
            base_url: endpoint.base_url.clone(),
            auth_type: endpoint.auth.auth_type(),
            username: endpoint.auth.username().map(str::to_string),
            secret,
            api_key_header: endpoint.auth.api_key_header().map(str::to_string),
            custom_headers: endpoint.custom_headers.clone(),
            allowed_operations: normalize_operations(&endpoint.allowed_operations),
            status: EndpointStatus::Active,
            last_tested_at: None,
            last_test_result: None,
            timeout_ms: endpoint.timeout_ms.filter(|ms| *ms > 0),
            verify_tls: endpoint.verify_tls,
            created_by: Some(created_by.to_string()),
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            "INSERT INTO api_endpoints (id, name, description, base_url, auth_type, username, secret_encrypted,
                api_key_header, custom_headers, allowed_operations, status, last_tested_at, last_test_result,
                timeout_ms, verify_tls, created_by, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&profile.id)
        .bind(&profile.name)
        .bind(&profile.description)
        .bind(&profile.base_url)
        .bind(profile.auth_type.as_str())
        .bind(&profile.username)
        .bind(profile.secret.as_ref().map(|s| s.as_envelope()))
        .bind(&profile.api_key_header)
        .bind(serde_json::to_string(&profile.custom_headers)?)
        .bind(serde_json::to_string(&profile.allowed_operations)?)
        .bind(profile.status.as_str())
        .bind(profile.last_tested_at)
        .bind(&profile.last_test_result)
        .bind(profile.timeout_ms.map(clamp_i64))
        .bind(profile.verify_tls)
        .bind(&profile.created_by)
        .bind(profile.created_at)
        .bind(profile.updated_at)
        .execute(&self.pool)
        .await?;

        tracing::info!("Created endpoint: {} (id: {})", profile.name, profile.id);
        Ok(profile)
    }

    /// Partial update. The stored ciphertext is only replaced when the
    /// update carries a non-empty secret. Written as a single statement;
    /// `status` is only touched when the update sets it, so a concurrent
    /// health write is not overwritten with a stale value.
    pub async fn update_endpoint(
        &self,
        id: &str,
        update: UpdateEndpoint,
    ) -> GatewayResult<EndpointProfile> {
        let mut profile = self.find_endpoint(id).await?;

        update.apply_to(&mut profile)?;
        if let Some(secret) = update.new_secret() {
            profile.secret = Some(self.cipher.encrypt(secret)?);
        }
        profile
            .auth_type
            .check_fields(profile.username.as_deref(), profile.secret.is_some())?;

        let result = sqlx::query(
            "UPDATE api_endpoints
             SET name = ?, description = ?, base_url = ?, auth_type = ?, username = ?, secret_encrypted = ?,
                 api_key_header = ?, custom_headers = ?, allowed_operations = ?, status = COALESCE(?, status),
                 timeout_ms = ?, verify_tls = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&profile.name)
        .bind(&profile.description)
        .bind(&profile.base_url)
        .bind(profile.auth_type.as_str())
        .bind(&profile.username)
        .bind(profile.secret.as_ref().map(|s| s.as_envelope()))
        .bind(&profile.api_key_header)
        .bind(serde_json::to_string(&profile.custom_headers)?)
        .bind(serde_json::to_string(&profile.allowed_operations)?)
        .bind(update.status.map(|s| s.as_str()))
        .bind(profile.timeout_ms.map(clamp_i64))
        .bind(profile.verify_tls)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(endpoint_not_found(id));
        }
        tracing::info!("Updated endpoint: {}", id);
        self.find_endpoint(id).await
    }

    /// Hard delete. Returns whether a row was removed.
    pub async fn delete_endpoint(&self, id: &str) -> GatewayResult<bool> {
        let result = sqlx::query("DELETE FROM api_endpoints WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected() > 0;
        if deleted {
            tracing::info!("Deleted endpoint: {}", id);
        }
        Ok(deleted)
    }

    /// Overwrites the health fields. Concurrent writers are last-writer-wins;
    /// an `inactive` status is left as is.
    pub async fn record_health(
        &self,
        id: &str,
        status: EndpointStatus,
        summary: &str,
        tested_at: DateTime<Utc>,
    ) -> GatewayResult<()> {
        sqlx::query(
            "UPDATE api_endpoints
             SET last_tested_at = ?, last_test_result = ?,
                 status = CASE WHEN status = 'inactive' THEN status ELSE ? END
             WHERE id = ?",
        )
        .bind(tested_at)
        .bind(summary)
        .bind(status.as_str())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[cfg(test)]
    pub async fn stored_envelope(&self, id: &str) -> GatewayResult<Option<String>> {
        let envelope: Option<Option<String>> =
            sqlx::query_scalar("SELECT secret_encrypted FROM api_endpoints WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(envelope.flatten())
    }

    #[cfg(test)]
    pub async fn overwrite_envelope(&self, id: &str, envelope: &str) -> GatewayResult<()> {
        sqlx::query("UPDATE api_endpoints SET secret_encrypted = ? WHERE id = ?")
            .bind(envelope)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn endpoint_not_found(id: &str) -> GatewayError {
    GatewayError::NotFound(format!("Endpoint {} not found", id))
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
pub(crate) async fn test_database() -> Database {
    Database::in_memory(Arc::new(crate::crypto::test_cipher()))
        .await
        .expect("in-memory database")
}
