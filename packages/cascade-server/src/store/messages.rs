//! Message rows and the guarded lifecycle updates.
//!
//! `delivered_at` and `read_at` only ever move from NULL to a value; the
//! guards make retries and concurrent writers converge on one outcome.

use cascade_proto::{MessageDto, MessageKind, UserDto};
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::Store;
use crate::error::{AppError, Result};
use crate::presence;

/// Outcome of the idempotent send upsert.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    /// A new row was written at this canonical timestamp.
    Inserted { created_at: DateTime<Utc> },
    /// The id was already stored; callers must verify the binding matches.
    Existing {
        conversation_id: Uuid,
        sender_id: Uuid,
        created_at: DateTime<Utc>,
    },
}

/// The columns authorisation and lifecycle checks need, without the joins.
#[derive(Debug, Clone, FromRow)]
pub struct MessageMeta {
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub kind: String,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow)]
struct MessageWithSenderRow {
    id: Uuid,
    conversation_id: Uuid,
    sender_id: Uuid,
    content: Option<String>,
    kind: String,
    reply_to: Option<Uuid>,
    created_at: DateTime<Utc>,
    edited_at: Option<DateTime<Utc>>,
    deleted_at: Option<DateTime<Utc>>,
    delivered_at: Option<DateTime<Utc>>,
    read_at: Option<DateTime<Utc>>,
    sender_display_name: String,
    sender_avatar_url: Option<String>,
    sender_last_seen_at: DateTime<Utc>,
}

impl Store {
    /// Idempotent send: insert keyed on the client-chosen id. A retry with
    /// the same id does not create a second row and does not bump
    /// `created_at`.
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_message(
        &self,
        id: Uuid,
        conversation: Uuid,
        sender: Uuid,
        content: Option<&str>,
        kind: MessageKind,
        reply_to: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let inserted = sqlx::query_scalar::<_, DateTime<Utc>>(
            "INSERT INTO messages (id, conversation_id, sender_id, content, kind, reply_to, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (id) DO NOTHING
             RETURNING created_at",
        )
        .bind(id)
        .bind(conversation)
        .bind(sender)
        .bind(content)
        .bind(kind.as_str())
        .bind(reply_to)
        .bind(now)
        .fetch_optional(self.pool())
        .await?;

        if let Some(created_at) = inserted {
            return Ok(UpsertOutcome::Inserted { created_at });
        }

        let existing = sqlx::query_as::<_, MessageMeta>(
            "SELECT conversation_id, sender_id, kind, created_at, deleted_at, delivered_at, read_at
             FROM messages WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| AppError::Internal("message vanished between upsert and readback".into()))?;

        Ok(UpsertOutcome::Existing {
            conversation_id: existing.conversation_id,
            sender_id: existing.sender_id,
            created_at: existing.created_at,
        })
    }

    pub async fn message_meta(&self, id: Uuid) -> Result<Option<MessageMeta>> {
        let meta = sqlx::query_as::<_, MessageMeta>(
            "SELECT conversation_id, sender_id, kind, created_at, deleted_at, delivered_at, read_at
             FROM messages WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        Ok(meta)
    }

    /// Advance a message to `delivered`. Fires at most once per message;
    /// returns the timestamp only when this call set it.
    pub async fn mark_delivered(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        let delivered_at = sqlx::query_scalar::<_, DateTime<Utc>>(
            "UPDATE messages SET delivered_at = $2
             WHERE id = $1 AND delivered_at IS NULL
             RETURNING delivered_at",
        )
        .bind(id)
        .bind(now)
        .fetch_optional(self.pool())
        .await?;
        Ok(delivered_at)
    }

    /// Advance a message to `read`, backfilling `delivered_at` with the
    /// same timestamp when it was still null (reading implies delivery).
    /// The sender's own reads never mark the message.
    pub async fn mark_read(
        &self,
        id: Uuid,
        reader: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let read_at = sqlx::query_scalar::<_, DateTime<Utc>>(
            "UPDATE messages
             SET read_at = $2, delivered_at = COALESCE(delivered_at, $2)
             WHERE id = $1 AND read_at IS NULL AND sender_id <> $3
             RETURNING read_at",
        )
        .bind(id)
        .bind(now)
        .bind(reader)
        .fetch_optional(self.pool())
        .await?;
        Ok(read_at)
    }

    /// Reconnect reconciliation: everything in the conversation that was
    /// sent *to* this user and never reached `delivered`. Returns the ids
    /// this call transitioned.
    pub async fn mark_conversation_delivered(
        &self,
        conversation: Uuid,
        recipient: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "UPDATE messages SET delivered_at = $3
             WHERE conversation_id = $1 AND sender_id <> $2 AND delivered_at IS NULL
             RETURNING id",
        )
        .bind(conversation)
        .bind(recipient)
        .bind(now)
        .fetch_all(self.pool())
        .await?;
        Ok(ids)
    }

    /// Is any member other than the sender inside the presence window?
    /// Derived from `last_seen_at`, so every instance reaches the same
    /// answer without sharing registries.
    pub async fn any_other_member_online(
        &self,
        conversation: Uuid,
        sender: Uuid,
        online_after: DateTime<Utc>,
    ) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (
                SELECT 1
                FROM conversation_members cm
                JOIN users u ON u.id = cm.user_id
                WHERE cm.conversation_id = $1
                  AND cm.user_id <> $2
                  AND u.last_seen_at > $3
             )",
        )
        .bind(conversation)
        .bind(sender)
        .bind(online_after)
        .fetch_one(self.pool())
        .await?;
        Ok(exists)
    }

    /// Guarded edit: sender only, text only, not deleted, within the edit
    /// window. Returns the conversation and `edited_at` when it landed.
    pub async fn edit_message(
        &self,
        id: Uuid,
        sender: Uuid,
        content: &str,
        now: DateTime<Utc>,
        window_start: DateTime<Utc>,
    ) -> Result<Option<(Uuid, DateTime<Utc>)>> {
        let row = sqlx::query_as::<_, (Uuid, DateTime<Utc>)>(
            "UPDATE messages SET content = $3, edited_at = $4
             WHERE id = $1 AND sender_id = $2 AND kind = 'text'
               AND deleted_at IS NULL AND created_at > $5
             RETURNING conversation_id, edited_at",
        )
        .bind(id)
        .bind(sender)
        .bind(content)
        .bind(now)
        .bind(window_start)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    /// Soft delete: tombstone the row, null the content, keep the lifecycle
    /// timestamps. Returns the conversation when this call deleted it.
    pub async fn soft_delete(
        &self,
        id: Uuid,
        sender: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>> {
        let conversation = sqlx::query_scalar::<_, Uuid>(
            "UPDATE messages SET deleted_at = $3, content = NULL
             WHERE id = $1 AND sender_id = $2 AND deleted_at IS NULL
             RETURNING conversation_id",
        )
        .bind(id)
        .bind(sender)
        .bind(now)
        .fetch_optional(self.pool())
        .await?;
        Ok(conversation)
    }

    /// Assemble the full wire shape for `new_message` broadcasts.
    pub async fn load_message_dto(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<MessageDto>> {
        let Some(row) = sqlx::query_as::<_, MessageWithSenderRow>(
            "SELECT m.id, m.conversation_id, m.sender_id, m.content, m.kind, m.reply_to,
                    m.created_at, m.edited_at, m.deleted_at, m.delivered_at, m.read_at,
                    u.display_name AS sender_display_name,
                    u.avatar_url AS sender_avatar_url,
                    u.last_seen_at AS sender_last_seen_at
             FROM messages m
             JOIN users u ON u.id = m.sender_id
             WHERE m.id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?
        else {
            return Ok(None);
        };

        let kind = MessageKind::parse(&row.kind)
            .ok_or_else(|| AppError::Internal(format!("unknown message kind '{}'", row.kind)))?;

        let attachments = self
            .attachments_for_message(id)
            .await?
            .into_iter()
            .map(|a| a.into_dto())
            .collect();
        let reactions = self
            .reactions_for_message(id)
            .await?
            .into_iter()
            .map(|r| r.into_dto())
            .collect();

        Ok(Some(MessageDto {
            id: row.id,
            conversation_id: row.conversation_id,
            sender: UserDto {
                id: row.sender_id,
                display_name: row.sender_display_name,
                avatar_url: row.sender_avatar_url,
                is_online: presence::is_online(row.sender_last_seen_at, now),
                last_seen_at: row.sender_last_seen_at,
            },
            // A tombstoned message never exposes content.
            content: if row.deleted_at.is_some() { None } else { row.content },
            kind,
            reply_to_id: row.reply_to,
            attachments,
            reactions,
            created_at: row.created_at,
            edited_at: row.edited_at,
            deleted_at: row.deleted_at,
            delivered_at: row.delivered_at,
            read_at: row.read_at,
        }))
    }
}
