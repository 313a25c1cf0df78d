//! Client and server event definitions.
//!
//! Frames are adjacently tagged: `{"type": "<snake_case>", "payload": {..}}`.
//! Events without a payload (`ping`, `pong`) omit the payload key entirely.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{ErrorCode, MessageDto, MessageKind};

// ── Client → Server ───────────────────────────────────────────────────────────

/// Events a client may send on its session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Keepalive; also counts as authenticated activity for presence.
    Ping,

    /// Declare interest in a set of conversations on this session.
    #[serde(rename_all = "camelCase")]
    Subscribe { conversation_ids: Vec<Uuid> },

    /// Withdraw interest; inverse of `subscribe`.
    #[serde(rename_all = "camelCase")]
    Unsubscribe { conversation_ids: Vec<Uuid> },

    /// Send a message. `id` is client-chosen so retries are idempotent.
    #[serde(rename_all = "camelCase")]
    SendMessage {
        id: Uuid,
        conversation_id: Uuid,
        content: Option<String>,
        #[serde(rename = "type")]
        kind: MessageKind,
        #[serde(default)]
        reply_to_id: Option<Uuid>,
        #[serde(default)]
        attachment_ids: Option<Vec<Uuid>>,
    },

    /// Replace the content of an own text message within the edit window.
    EditMessage { id: Uuid, content: String },

    /// Soft-delete an own message.
    DeleteMessage { id: Uuid },

    /// Transient typing signal; never persisted.
    #[serde(rename_all = "camelCase")]
    Typing {
        conversation_id: Uuid,
        is_typing: bool,
    },

    /// The conversation is foregrounded and read up to `messageId`.
    #[serde(rename_all = "camelCase")]
    Read {
        conversation_id: Uuid,
        message_id: Uuid,
    },

    /// Upsert (`emoji` set) or remove (`emoji` null) the caller's reaction.
    #[serde(rename_all = "camelCase")]
    React {
        message_id: Uuid,
        emoji: Option<String>,
    },

    /// Forward-compatibility: unrecognised event types are logged and
    /// ignored rather than failing the session.
    #[serde(other)]
    Unknown,
}

// ── Server → Client ───────────────────────────────────────────────────────────

/// Ack outcome for a `send_message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Ok,
    Error,
}

/// Presence transition carried by `presence` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// Events the server pushes to sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Response to `ping`.
    Pong,

    /// Exactly one per successful send; echoes the client id and the
    /// canonical server `created_at`. Written to the originating socket
    /// before the `new_message` broadcast is published.
    #[serde(rename_all = "camelCase")]
    MessageAck {
        id: Uuid,
        status: AckStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorCode>,
    },

    /// A freshly persisted message, fanned out on its conversation topic.
    NewMessage(MessageDto),

    #[serde(rename_all = "camelCase")]
    MessageUpdated {
        id: Uuid,
        conversation_id: Uuid,
        content: String,
        edited_at: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    MessageDeleted { id: Uuid, conversation_id: Uuid },

    /// First recipient was online: the message reached `delivered`.
    #[serde(rename_all = "camelCase")]
    DeliveryReceipt {
        conversation_id: Uuid,
        message_id: Uuid,
        delivered_at: DateTime<Utc>,
    },

    /// A member read up to this message.
    #[serde(rename_all = "camelCase")]
    ReadReceipt {
        conversation_id: Uuid,
        user_id: Uuid,
        message_id: Uuid,
        read_at: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    Typing {
        conversation_id: Uuid,
        user_id: Uuid,
        is_typing: bool,
    },

    #[serde(rename_all = "camelCase")]
    Presence {
        user_id: Uuid,
        status: PresenceStatus,
        last_seen_at: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    ReactionUpdated {
        message_id: Uuid,
        conversation_id: Uuid,
        user_id: Uuid,
        emoji: Option<String>,
    },

    /// Operation-level failure reported to the initiating client only.
    Error { code: ErrorCode, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UserDto;

    #[test]
    fn test_ping_pong_have_no_payload() {
        assert_eq!(
            serde_json::to_string(&ClientEvent::Ping).unwrap(),
            "{\"type\":\"ping\"}"
        );
        assert_eq!(
            serde_json::to_string(&ServerEvent::Pong).unwrap(),
            "{\"type\":\"pong\"}"
        );
    }

    #[test]
    fn test_send_message_wire_shape() {
        let raw = r#"{
            "type": "send_message",
            "payload": {
                "id": "6f2c0a31-30a3-4bb7-9c07-0d9784e13be1",
                "conversationId": "a3a83d1d-7c57-4b7e-b9a6-66985cf1d19d",
                "content": "hi",
                "type": "text"
            }
        }"#;

        let parsed: ClientEvent = serde_json::from_str(raw).unwrap();
        match parsed {
            ClientEvent::SendMessage {
                content,
                kind,
                reply_to_id,
                attachment_ids,
                ..
            } => {
                assert_eq!(content.as_deref(), Some("hi"));
                assert_eq!(kind, MessageKind::Text);
                assert!(reply_to_id.is_none());
                assert!(attachment_ids.is_none());
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_client_event_is_tolerated() {
        let raw = r#"{"type": "start_call", "payload": {"roomId": "x"}}"#;
        let parsed: ClientEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed, ClientEvent::Unknown);
    }

    #[test]
    fn test_read_event_uses_camel_case() {
        let event = ClientEvent::Read {
            conversation_id: Uuid::new_v4(),
            message_id: Uuid::new_v4(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"read\""));
        assert!(json.contains("\"conversationId\""));
        assert!(json.contains("\"messageId\""));
    }

    #[test]
    fn test_react_null_emoji_round_trips() {
        let event = ClientEvent::React {
            message_id: Uuid::new_v4(),
            emoji: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        let parsed: ClientEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_ok_ack_has_timestamp_and_no_error() {
        let ack = ServerEvent::MessageAck {
            id: Uuid::new_v4(),
            status: AckStatus::Ok,
            timestamp: Some(Utc::now()),
            error: None,
        };
        let json = serde_json::to_string(&ack).unwrap();
        assert!(json.contains("\"status\":\"ok\""));
        assert!(json.contains("\"timestamp\""));
        assert!(!json.contains("\"error\""));
    }

    #[test]
    fn test_error_ack_carries_code() {
        let ack = ServerEvent::MessageAck {
            id: Uuid::new_v4(),
            status: AckStatus::Error,
            timestamp: None,
            error: Some(ErrorCode::Forbidden),
        };
        let json = serde_json::to_string(&ack).unwrap();
        assert!(json.contains("\"status\":\"error\""));
        assert!(json.contains("\"error\":\"FORBIDDEN\""));
        assert!(!json.contains("\"timestamp\""));
    }

    #[test]
    fn test_new_message_nests_full_dto() {
        let now = Utc::now();
        let event = ServerEvent::NewMessage(MessageDto {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            sender: UserDto {
                id: Uuid::new_v4(),
                display_name: "bob".to_string(),
                avatar_url: None,
                last_seen_at: now,
                is_online: false,
            },
            content: None,
            kind: MessageKind::Image,
            reply_to_id: None,
            attachments: vec![],
            reactions: vec![],
            created_at: now,
            edited_at: None,
            deleted_at: None,
            delivered_at: None,
            read_at: None,
        });

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"new_message\""));
        assert!(json.contains("\"payload\":{"));
        assert!(json.contains("\"type\":\"image\""));

        let parsed: ServerEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_all_server_event_variants_round_trip() {
        let now = Utc::now();
        let events = vec![
            ServerEvent::Pong,
            ServerEvent::MessageAck {
                id: Uuid::new_v4(),
                status: AckStatus::Ok,
                timestamp: Some(now),
                error: None,
            },
            ServerEvent::MessageUpdated {
                id: Uuid::new_v4(),
                conversation_id: Uuid::new_v4(),
                content: "fixed".to_string(),
                edited_at: now,
            },
            ServerEvent::MessageDeleted {
                id: Uuid::new_v4(),
                conversation_id: Uuid::new_v4(),
            },
            ServerEvent::DeliveryReceipt {
                conversation_id: Uuid::new_v4(),
                message_id: Uuid::new_v4(),
                delivered_at: now,
            },
            ServerEvent::ReadReceipt {
                conversation_id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
                message_id: Uuid::new_v4(),
                read_at: now,
            },
            ServerEvent::Typing {
                conversation_id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
                is_typing: true,
            },
            ServerEvent::Presence {
                user_id: Uuid::new_v4(),
                status: PresenceStatus::Offline,
                last_seen_at: now,
            },
            ServerEvent::ReactionUpdated {
                message_id: Uuid::new_v4(),
                conversation_id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
                emoji: Some("👍".to_string()),
            },
            ServerEvent::Error {
                code: ErrorCode::NotFound,
                message: "no such conversation".to_string(),
            },
        ];

        for event in events {
            let json = serde_json::to_string(&event).unwrap();
            let parsed: ServerEvent = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, event, "round-trip failed for {}", json);
        }
    }
}
