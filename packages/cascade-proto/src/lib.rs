//! Cascade wire protocol.
//!
//! The server speaks JSON-over-WebSocket: one event per text frame, shaped
//! as `{"type": "...", "payload": {...}}`. Event names are snake_case,
//! payload fields are camelCase. The enums here are the single source of
//! truth for both sides of the wire.

mod events;
mod types;

pub use events::{AckStatus, ClientEvent, PresenceStatus, ServerEvent};
pub use types::{
    AttachmentDto, ConversationKind, ErrorCode, MemberRole, MessageDto, MessageKind, ReactionDto,
    UserDto,
};

/// Close code sent when the connect-time credential is missing or invalid.
pub const CLOSE_UNAUTHORIZED: u16 = 4001;

/// Window after which a user with no fresh activity counts as offline.
pub const PRESENCE_WINDOW_SECS: i64 = 30;

/// A sender may edit a text message for this long after creation.
pub const EDIT_WINDOW_SECS: i64 = 300;

/// Clients mark an unacked send as failed after this long.
pub const SEND_ACK_TIMEOUT_SECS: u64 = 10;

/// Clients expire a peer's typing indicator after this much silence.
pub const TYPING_EXPIRY_MS: u64 = 3_000;

/// Clients debounce their own typing emissions to roughly this interval.
pub const TYPING_DEBOUNCE_MS: u64 = 500;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_code_is_above_reserved_range() {
        // 4000-4999 is the application range for WebSocket close codes.
        assert!(CLOSE_UNAUTHORIZED >= 4000 && CLOSE_UNAUTHORIZED < 5000);
    }

    #[test]
    fn test_edit_window_and_presence_window() {
        assert_eq!(EDIT_WINDOW_SECS, 5 * 60);
        assert_eq!(PRESENCE_WINDOW_SECS, 30);
    }
}
