//! Refresh credentials, hashed at rest.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::Store;
use crate::error::Result;

#[derive(Debug, Clone, FromRow)]
pub struct RefreshCredentialRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl RefreshCredentialRow {
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at > now
    }
}

impl Store {
    pub async fn insert_refresh_credential(
        &self,
        user: Uuid,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<RefreshCredentialRow> {
        let row = sqlx::query_as::<_, RefreshCredentialRow>(
            "INSERT INTO refresh_credentials (id, user_id, token_hash, expires_at)
             VALUES ($1, $2, $3, $4)
             RETURNING id, user_id, token_hash, expires_at, revoked_at, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(user)
        .bind(token_hash)
        .bind(expires_at)
        .fetch_one(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn find_refresh_credential(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshCredentialRow>> {
        let row = sqlx::query_as::<_, RefreshCredentialRow>(
            "SELECT id, user_id, token_hash, expires_at, revoked_at, created_at
             FROM refresh_credentials WHERE token_hash = $1",
        )
        .bind(token_hash)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn revoke_refresh_credential(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE refresh_credentials SET revoked_at = $2
             WHERE token_hash = $1 AND revoked_at IS NULL",
        )
        .bind(token_hash)
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Drop credentials that can never validate again.
    pub async fn purge_expired_credentials(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM refresh_credentials WHERE expires_at < $1 OR revoked_at IS NOT NULL",
        )
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }
}
