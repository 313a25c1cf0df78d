//! Attachment references. The blobs live in external object storage; a row
//! is registered by the upload collaborator and linked to a message here.

use cascade_proto::AttachmentDto;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::Store;
use crate::error::Result;

#[derive(Debug, Clone, FromRow)]
pub struct AttachmentRow {
    pub id: Uuid,
    pub message_id: Option<Uuid>,
    pub url: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub thumbnail_url: Option<String>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub duration_secs: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl AttachmentRow {
    pub fn into_dto(self) -> AttachmentDto {
        AttachmentDto {
            id: self.id,
            url: self.url,
            mime_type: self.mime_type,
            size_bytes: self.size_bytes,
            thumbnail_url: self.thumbnail_url,
            width: self.width,
            height: self.height,
            duration_secs: self.duration_secs,
        }
    }
}

impl Store {
    /// Register an uploaded blob, not yet linked to a message.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_attachment(
        &self,
        url: &str,
        mime_type: &str,
        size_bytes: i64,
        thumbnail_url: Option<&str>,
        width: Option<i32>,
        height: Option<i32>,
        duration_secs: Option<f64>,
    ) -> Result<AttachmentRow> {
        let row = sqlx::query_as::<_, AttachmentRow>(
            "INSERT INTO attachments
                (id, url, mime_type, size_bytes, thumbnail_url, width, height, duration_secs)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING id, message_id, url, mime_type, size_bytes, thumbnail_url,
                       width, height, duration_secs, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(url)
        .bind(mime_type)
        .bind(size_bytes)
        .bind(thumbnail_url)
        .bind(width)
        .bind(height)
        .bind(duration_secs)
        .fetch_one(self.pool())
        .await?;
        Ok(row)
    }

    /// Bind uploaded attachments to a freshly inserted message. Already
    /// linked ids are left untouched so retries cannot steal attachments.
    pub async fn link_attachments(&self, message: Uuid, ids: &[Uuid]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            "UPDATE attachments SET message_id = $1 WHERE id = ANY($2) AND message_id IS NULL",
        )
        .bind(message)
        .bind(ids)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn attachments_for_message(&self, message: Uuid) -> Result<Vec<AttachmentRow>> {
        let rows = sqlx::query_as::<_, AttachmentRow>(
            "SELECT id, message_id, url, mime_type, size_bytes, thumbnail_url,
                    width, height, duration_secs, created_at
             FROM attachments WHERE message_id = $1
             ORDER BY created_at",
        )
        .bind(message)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }
}
