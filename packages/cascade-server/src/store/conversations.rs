//! Conversations, memberships, and invite tokens.

use cascade_proto::{ConversationKind, MemberRole};
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::Store;
use crate::auth;
use crate::error::Result;

#[derive(Debug, Clone, FromRow)]
pub struct ConversationRow {
    pub id: Uuid,
    pub kind: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationRow {
    pub fn is_channel(&self) -> bool {
        self.kind == ConversationKind::Channel.as_str()
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct MembershipRow {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub role: String,
    pub last_read_message_id: Option<Uuid>,
    pub joined_at: DateTime<Utc>,
}

impl MembershipRow {
    pub fn is_admin(&self) -> bool {
        self.role == MemberRole::Admin.as_str()
    }
}

impl Store {
    /// Create a conversation with its creator as admin.
    pub async fn create_conversation(
        &self,
        kind: ConversationKind,
        name: Option<&str>,
        creator: Uuid,
    ) -> Result<ConversationRow> {
        let mut tx = self.pool().begin().await?;

        let row = sqlx::query_as::<_, ConversationRow>(
            "INSERT INTO conversations (id, kind, name) VALUES ($1, $2, $3)
             RETURNING id, kind, name, created_at, updated_at",
        )
        .bind(Uuid::new_v4())
        .bind(kind.as_str())
        .bind(name)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO conversation_members (conversation_id, user_id, role)
             VALUES ($1, $2, 'admin')",
        )
        .bind(row.id)
        .bind(creator)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row)
    }

    pub async fn conversation(&self, id: Uuid) -> Result<Option<ConversationRow>> {
        let row = sqlx::query_as::<_, ConversationRow>(
            "SELECT id, kind, name, created_at, updated_at FROM conversations WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    /// Add a member. Returns false when the membership already existed —
    /// at most one row per (conversation, user).
    pub async fn add_member(
        &self,
        conversation: Uuid,
        user: Uuid,
        role: MemberRole,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO conversation_members (conversation_id, user_id, role)
             VALUES ($1, $2, $3)
             ON CONFLICT (conversation_id, user_id) DO NOTHING",
        )
        .bind(conversation)
        .bind(user)
        .bind(role.as_str())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn membership(&self, conversation: Uuid, user: Uuid) -> Result<Option<MembershipRow>> {
        let row = sqlx::query_as::<_, MembershipRow>(
            "SELECT conversation_id, user_id, role, last_read_message_id, joined_at
             FROM conversation_members
             WHERE conversation_id = $1 AND user_id = $2",
        )
        .bind(conversation)
        .bind(user)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn is_member(&self, conversation: Uuid, user: Uuid) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (
                SELECT 1 FROM conversation_members
                WHERE conversation_id = $1 AND user_id = $2
             )",
        )
        .bind(conversation)
        .bind(user)
        .fetch_one(self.pool())
        .await?;
        Ok(exists)
    }

    /// Every conversation the user belongs to (presence broadcast targets).
    pub async fn member_conversation_ids(&self, user: Uuid) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT conversation_id FROM conversation_members WHERE user_id = $1",
        )
        .bind(user)
        .fetch_all(self.pool())
        .await?;
        Ok(ids)
    }

    /// Advance the member's read cursor, but only forwards in the canonical
    /// `(created_at, id)` order. Returns whether the cursor moved.
    pub async fn advance_last_read(
        &self,
        conversation: Uuid,
        user: Uuid,
        message: Uuid,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE conversation_members cm
             SET last_read_message_id = $3
             WHERE cm.conversation_id = $1 AND cm.user_id = $2
               AND (
                    cm.last_read_message_id IS NULL
                    OR EXISTS (
                        SELECT 1 FROM messages prev, messages next
                        WHERE prev.id = cm.last_read_message_id
                          AND next.id = $3
                          AND (prev.created_at, prev.id) < (next.created_at, next.id)
                    )
               )",
        )
        .bind(conversation)
        .bind(user)
        .bind(message)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ── Invite tokens ─────────────────────────────────────────────────────

    /// Get the conversation's invite token, minting one on first use.
    /// The token is constant per conversation and reusable.
    pub async fn ensure_invite_token(&self, conversation: Uuid) -> Result<String> {
        sqlx::query(
            "INSERT INTO invite_tokens (token, conversation_id) VALUES ($1, $2)
             ON CONFLICT (conversation_id) DO NOTHING",
        )
        .bind(auth::mint_invite_token())
        .bind(conversation)
        .execute(self.pool())
        .await?;

        let token = sqlx::query_scalar::<_, String>(
            "SELECT token FROM invite_tokens WHERE conversation_id = $1",
        )
        .bind(conversation)
        .fetch_one(self.pool())
        .await?;
        Ok(token)
    }

    pub async fn resolve_invite(&self, token: &str) -> Result<Option<Uuid>> {
        let conversation = sqlx::query_scalar::<_, Uuid>(
            "SELECT conversation_id FROM invite_tokens WHERE token = $1",
        )
        .bind(token)
        .fetch_optional(self.pool())
        .await?;
        Ok(conversation)
    }
}
