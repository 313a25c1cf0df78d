//! Idempotent per-user emoji reactions.

use cascade_proto::ReactionDto;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::Store;
use crate::error::Result;

#[derive(Debug, Clone, FromRow)]
pub struct ReactionRow {
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

impl ReactionRow {
    pub fn into_dto(self) -> ReactionDto {
        ReactionDto {
            user_id: self.user_id,
            emoji: self.emoji,
            created_at: self.created_at,
        }
    }
}

impl Store {
    /// Upsert on (message, user): a second reaction replaces the first.
    pub async fn set_reaction(
        &self,
        message: Uuid,
        user: Uuid,
        emoji: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO reactions (message_id, user_id, emoji, created_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (message_id, user_id) DO UPDATE
                SET emoji = EXCLUDED.emoji, created_at = EXCLUDED.created_at",
        )
        .bind(message)
        .bind(user)
        .bind(emoji)
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Remove the user's reaction. Returns whether one existed.
    pub async fn clear_reaction(&self, message: Uuid, user: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM reactions WHERE message_id = $1 AND user_id = $2")
            .bind(message)
            .bind(user)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn reactions_for_message(&self, message: Uuid) -> Result<Vec<ReactionRow>> {
        let rows = sqlx::query_as::<_, ReactionRow>(
            "SELECT message_id, user_id, emoji, created_at
             FROM reactions WHERE message_id = $1
             ORDER BY created_at",
        )
        .bind(message)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }
}
