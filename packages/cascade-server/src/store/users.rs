//! User rows and presence timestamps.

use cascade_proto::UserDto;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::Store;
use crate::error::Result;
use crate::presence;

#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub id: Uuid,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub last_seen_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl UserRow {
    pub fn into_dto(self, now: DateTime<Utc>) -> UserDto {
        UserDto {
            id: self.id,
            display_name: self.display_name,
            avatar_url: self.avatar_url,
            is_online: presence::is_online(self.last_seen_at, now),
            last_seen_at: self.last_seen_at,
        }
    }
}

impl Store {
    /// Create or refresh a user profile.
    pub async fn upsert_user(
        &self,
        id: Uuid,
        display_name: &str,
        avatar_url: Option<&str>,
    ) -> Result<UserRow> {
        let row = sqlx::query_as::<_, UserRow>(
            "INSERT INTO users (id, display_name, avatar_url) VALUES ($1, $2, $3)
             ON CONFLICT (id) DO UPDATE
                SET display_name = EXCLUDED.display_name,
                    avatar_url = EXCLUDED.avatar_url
             RETURNING id, display_name, avatar_url, last_seen_at, created_at",
        )
        .bind(id)
        .bind(display_name)
        .bind(avatar_url)
        .fetch_one(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn get_user(&self, id: Uuid) -> Result<Option<UserRow>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, display_name, avatar_url, last_seen_at, created_at
             FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    /// Record authenticated activity for presence derivation.
    pub async fn touch_last_seen(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE users SET last_seen_at = $2 WHERE id = $1")
            .bind(id)
            .bind(now)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Heartbeat for all locally attached users in one statement.
    pub async fn touch_many(&self, ids: &[Uuid], now: DateTime<Utc>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query("UPDATE users SET last_seen_at = $2 WHERE id = ANY($1)")
            .bind(ids)
            .bind(now)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Of the given users, those whose last activity fell before the cutoff.
    pub async fn stale_users(
        &self,
        ids: &[Uuid],
        seen_before: DateTime<Utc>,
    ) -> Result<Vec<UserRow>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, UserRow>(
            "SELECT id, display_name, avatar_url, last_seen_at, created_at
             FROM users WHERE id = ANY($1) AND last_seen_at < $2",
        )
        .bind(ids)
        .bind(seen_before)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }
}
