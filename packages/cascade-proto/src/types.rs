//! Shared payload types: message/user/attachment/reaction DTOs, the
//! conversation and message kind enums, and the client-facing error codes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a conversation is, which only changes who may post.
///
/// Channels restrict sending to admin-role members; groups and DMs accept
/// messages from any member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Group,
    Channel,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationKind::Direct => "direct",
            ConversationKind::Group => "group",
            ConversationKind::Channel => "channel",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(ConversationKind::Direct),
            "group" => Some(ConversationKind::Group),
            "channel" => Some(ConversationKind::Channel),
            _ => None,
        }
    }
}

/// Message content variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Voice,
    System,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Video => "video",
            MessageKind::Voice => "voice",
            MessageKind::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(MessageKind::Text),
            "image" => Some(MessageKind::Image),
            "video" => Some(MessageKind::Video),
            "voice" => Some(MessageKind::Voice),
            "system" => Some(MessageKind::System),
            _ => None,
        }
    }
}

/// Membership role within a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Admin,
    Member,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Admin => "admin",
            MemberRole::Member => "member",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(MemberRole::Admin),
            "member" => Some(MemberRole::Member),
            _ => None,
        }
    }
}

/// Machine-readable error codes carried by `error` events and error acks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Missing or invalid credential at connect; the session is closed.
    Unauthorized,
    /// The operation needs a membership or role the user lacks.
    Forbidden,
    /// Malformed frame or schema-invalid payload.
    InvalidMessage,
    /// Referenced message/conversation/invite does not exist or is hidden.
    NotFound,
    /// Edit window expired, content kind not editable, or id reuse mismatch.
    Conflict,
    /// Too many requests on a rate-limited path.
    RateLimited,
    /// Persist or broadcast failure; retry with the same id is safe.
    Internal,
}

/// A user as embedded in server events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDto {
    pub id: Uuid,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub last_seen_at: DateTime<Utc>,
    /// Derived: `now - lastSeenAt` within the presence window.
    pub is_online: bool,
}

/// An externally-stored blob linked to a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentDto {
    pub id: Uuid,
    pub url: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub thumbnail_url: Option<String>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub duration_secs: Option<f64>,
}

/// One user's emoji reaction on a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionDto {
    pub user_id: Uuid,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

/// The full message shape broadcast in `new_message` events and returned by
/// the history endpoints.
///
/// `deliveredAt` and `readAt` are server-authoritative; clients must never
/// regress a message's lifecycle state based on missing live events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDto {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender: UserDto,
    /// None for deleted messages and non-text kinds without a caption.
    pub content: Option<String>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub reply_to_id: Option<Uuid>,
    pub attachments: Vec<AttachmentDto>,
    pub reactions: Vec<ReactionDto>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trips() {
        for kind in ["direct", "group", "channel"] {
            assert_eq!(ConversationKind::parse(kind).unwrap().as_str(), kind);
        }
        for kind in ["text", "image", "video", "voice", "system"] {
            assert_eq!(MessageKind::parse(kind).unwrap().as_str(), kind);
        }
        for role in ["admin", "member"] {
            assert_eq!(MemberRole::parse(role).unwrap().as_str(), role);
        }
        assert!(ConversationKind::parse("broadcast").is_none());
        assert!(MessageKind::parse("sticker").is_none());
    }

    #[test]
    fn test_error_codes_are_screaming_snake_case() {
        let json = serde_json::to_string(&ErrorCode::InvalidMessage).unwrap();
        assert_eq!(json, "\"INVALID_MESSAGE\"");
        let json = serde_json::to_string(&ErrorCode::RateLimited).unwrap();
        assert_eq!(json, "\"RATE_LIMITED\"");

        let parsed: ErrorCode = serde_json::from_str("\"FORBIDDEN\"").unwrap();
        assert_eq!(parsed, ErrorCode::Forbidden);
    }

    #[test]
    fn test_message_dto_wire_shape() {
        let now = Utc::now();
        let dto = MessageDto {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            sender: UserDto {
                id: Uuid::new_v4(),
                display_name: "alice".to_string(),
                avatar_url: None,
                last_seen_at: now,
                is_online: true,
            },
            content: Some("hi".to_string()),
            kind: MessageKind::Text,
            reply_to_id: None,
            attachments: vec![],
            reactions: vec![],
            created_at: now,
            edited_at: None,
            deleted_at: None,
            delivered_at: None,
            read_at: None,
        };

        let json = serde_json::to_string(&dto).unwrap();
        assert!(json.contains("\"conversationId\""));
        assert!(json.contains("\"type\":\"text\""));
        assert!(json.contains("\"deliveredAt\":null"));
        assert!(json.contains("\"readAt\":null"));
        assert!(json.contains("\"displayName\":\"alice\""));

        let parsed: MessageDto = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, dto);
    }
}
