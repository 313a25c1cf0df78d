//! SQL schema for the durable store.
//!
//! Statements are idempotent and run in order at startup. Check constraints
//! enforce the message lifecycle invariants at the storage boundary; a
//! trigger bumps the conversation's `updated_at` on every message insert.

pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id UUID PRIMARY KEY,
        display_name TEXT NOT NULL,
        avatar_url TEXT,
        last_seen_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS conversations (
        id UUID PRIMARY KEY,
        kind TEXT NOT NULL CHECK (kind IN ('direct', 'group', 'channel')),
        name TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS conversation_members (
        conversation_id UUID NOT NULL REFERENCES conversations (id) ON DELETE CASCADE,
        user_id UUID NOT NULL REFERENCES users (id) ON DELETE CASCADE,
        role TEXT NOT NULL DEFAULT 'member' CHECK (role IN ('admin', 'member')),
        last_read_message_id UUID,
        joined_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (conversation_id, user_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS conversation_members_user_idx ON conversation_members (user_id)",
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        id UUID PRIMARY KEY,
        conversation_id UUID NOT NULL REFERENCES conversations (id) ON DELETE CASCADE,
        sender_id UUID NOT NULL REFERENCES users (id),
        content TEXT,
        kind TEXT NOT NULL CHECK (kind IN ('text', 'image', 'video', 'voice', 'system')),
        reply_to UUID REFERENCES messages (id),
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        edited_at TIMESTAMPTZ,
        deleted_at TIMESTAMPTZ,
        delivered_at TIMESTAMPTZ,
        read_at TIMESTAMPTZ,
        CONSTRAINT messages_delivered_after_created
            CHECK (delivered_at IS NULL OR delivered_at >= created_at),
        CONSTRAINT messages_read_implies_delivered
            CHECK (read_at IS NULL OR (delivered_at IS NOT NULL AND read_at >= delivered_at))
    )
    "#,
    "CREATE INDEX IF NOT EXISTS messages_conversation_created_idx ON messages (conversation_id, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS messages_sender_idx ON messages (sender_id)",
    "CREATE INDEX IF NOT EXISTS messages_reply_to_idx ON messages (reply_to)",
    r#"
    CREATE TABLE IF NOT EXISTS reactions (
        message_id UUID NOT NULL REFERENCES messages (id) ON DELETE CASCADE,
        user_id UUID NOT NULL REFERENCES users (id) ON DELETE CASCADE,
        emoji TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (message_id, user_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS reactions_user_idx ON reactions (user_id)",
    r#"
    CREATE TABLE IF NOT EXISTS attachments (
        id UUID PRIMARY KEY,
        message_id UUID REFERENCES messages (id) ON DELETE SET NULL,
        url TEXT NOT NULL,
        mime_type TEXT NOT NULL,
        size_bytes BIGINT NOT NULL,
        thumbnail_url TEXT,
        width INT,
        height INT,
        duration_secs DOUBLE PRECISION,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS attachments_message_idx ON attachments (message_id)",
    r#"
    CREATE TABLE IF NOT EXISTS refresh_credentials (
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL REFERENCES users (id) ON DELETE CASCADE,
        token_hash TEXT NOT NULL UNIQUE,
        expires_at TIMESTAMPTZ NOT NULL,
        revoked_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS refresh_credentials_user_idx ON refresh_credentials (user_id)",
    r#"
    CREATE TABLE IF NOT EXISTS invite_tokens (
        token TEXT PRIMARY KEY,
        conversation_id UUID NOT NULL UNIQUE REFERENCES conversations (id) ON DELETE CASCADE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE OR REPLACE FUNCTION cascade_bump_conversation() RETURNS trigger
    LANGUAGE plpgsql AS $$
    BEGIN
        UPDATE conversations SET updated_at = NEW.created_at WHERE id = NEW.conversation_id;
        RETURN NEW;
    END
    $$
    "#,
    "DROP TRIGGER IF EXISTS messages_bump_conversation ON messages",
    r#"
    CREATE TRIGGER messages_bump_conversation
    AFTER INSERT ON messages
    FOR EACH ROW EXECUTE FUNCTION cascade_bump_conversation()
    "#,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_covers_every_table() {
        let joined = SCHEMA.join("\n");
        for table in [
            "users",
            "conversations",
            "conversation_members",
            "messages",
            "reactions",
            "attachments",
            "refresh_credentials",
            "invite_tokens",
        ] {
            assert!(
                joined.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")),
                "missing table {table}"
            );
        }
    }

    #[test]
    fn test_lifecycle_constraints_present() {
        let joined = SCHEMA.join("\n");
        assert!(joined.contains("messages_delivered_after_created"));
        assert!(joined.contains("messages_read_implies_delivered"));
        assert!(joined.contains("messages_bump_conversation"));
    }
}
