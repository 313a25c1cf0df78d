//! The message state machine and the other per-event operations.
//!
//! Every mutating operation follows the same template: validate shape,
//! authorise against the store, persist, ack where applicable, publish on
//! the conversation topic. Persist failures propagate to the dispatcher
//! (the client retries with the same id); publish failures are logged and
//! swallowed because the persisted row is already the truth of record.

use cascade_proto::{AckStatus, MessageKind, PresenceStatus, ServerEvent, EDIT_WINDOW_SECS};
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::presence;
use crate::registry::SessionId;
use crate::state::AppState;
use crate::store::UpsertOutcome;

/// Upper bound on a reaction emoji, in characters.
const MAX_EMOJI_CHARS: usize = 16;

/// Whether `created_at` is still inside the edit window at `now`.
pub fn edit_window_open(created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now - created_at < Duration::seconds(EDIT_WINDOW_SECS)
}

/// Shape check for a send: text messages need non-empty content.
pub fn validate_send(kind: MessageKind, content: Option<&str>) -> std::result::Result<(), &'static str> {
    match kind {
        MessageKind::Text if content.map(|c| c.trim().is_empty()).unwrap_or(true) => {
            Err("text messages need content")
        }
        _ => Ok(()),
    }
}

fn validate_emoji(emoji: &str) -> std::result::Result<(), &'static str> {
    if emoji.is_empty() {
        return Err("emoji must not be empty");
    }
    if emoji.chars().count() > MAX_EMOJI_CHARS {
        return Err("emoji too long");
    }
    Ok(())
}

/// Serialize an event once and queue it on one local session.
pub fn send_to_session(state: &AppState, session: SessionId, event: &ServerEvent) {
    match serde_json::to_string(event) {
        Ok(frame) => {
            state.registry.send_to_session(session, &frame);
        }
        Err(e) => tracing::error!(error = %e, "Failed to serialize server event"),
    }
}

/// Publish an event on a conversation topic. Failures are logged only: the
/// persisted state is authoritative and fetch reconciliation heals missed
/// pushes.
async fn publish(state: &AppState, conversation: Uuid, event: &ServerEvent) {
    let frame = match serde_json::to_string(event) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize server event");
            return;
        }
    };
    if let Err(e) = state.bus.publish(conversation, &frame).await {
        tracing::warn!(conversation = %conversation, error = %e, "Bus publish failed");
    }
}

// ── Subscriptions ─────────────────────────────────────────────────────────────

/// Membership-checked subscribe. The first local subscriber of a topic
/// opens the bus subscription; each newly visible conversation is then
/// reconciled for missed deliveries (the reconnect path).
pub async fn subscribe(
    state: &AppState,
    session: SessionId,
    user: Uuid,
    conversation_ids: Vec<Uuid>,
) -> Result<()> {
    let mut allowed = Vec::with_capacity(conversation_ids.len());
    let mut denied = false;
    for conversation in conversation_ids {
        if state.store.is_member(conversation, user).await? {
            allowed.push(conversation);
        } else {
            denied = true;
        }
    }

    for topic in state.registry.subscribe(session, &allowed) {
        state.bus.subscribe(topic);
    }

    for &conversation in &allowed {
        if let Err(e) = reconcile_delivery(state, conversation, user).await {
            tracing::warn!(
                conversation = %conversation,
                user = %user,
                error = %e,
                "Delivery reconciliation failed"
            );
        }
    }

    if denied {
        return Err(AppError::Forbidden("not a member of one or more conversations"));
    }
    Ok(())
}

pub fn unsubscribe(state: &AppState, session: SessionId, conversation_ids: Vec<Uuid>) {
    for topic in state.registry.unsubscribe(session, &conversation_ids) {
        state.bus.unsubscribe(topic);
    }
}

/// On first observation of the user as an online recipient, advance any of
/// their undelivered inbound messages to `delivered` and broadcast each
/// receipt. Channels never produce delivery receipts.
async fn reconcile_delivery(state: &AppState, conversation: Uuid, user: Uuid) -> Result<()> {
    let Some(row) = state.store.conversation(conversation).await? else {
        return Ok(());
    };
    if row.is_channel() {
        return Ok(());
    }

    let now = Utc::now();
    for message_id in state
        .store
        .mark_conversation_delivered(conversation, user, now)
        .await?
    {
        publish(
            state,
            conversation,
            &ServerEvent::DeliveryReceipt {
                conversation_id: conversation,
                message_id,
                delivered_at: now,
            },
        )
        .await;
    }
    Ok(())
}

// ── Send ──────────────────────────────────────────────────────────────────────

/// The send path: validate → authorise → idempotent upsert → ack → publish
/// → delivered transition. The ack is written to the originating socket
/// before the broadcast is published, so the sender's other sessions see
/// the ack strictly before the bus echo.
#[allow(clippy::too_many_arguments)]
pub async fn send_message(
    state: &AppState,
    session: SessionId,
    user: Uuid,
    id: Uuid,
    conversation_id: Uuid,
    content: Option<String>,
    kind: MessageKind,
    reply_to_id: Option<Uuid>,
    attachment_ids: Option<Vec<Uuid>>,
) -> Result<()> {
    validate_send(kind, content.as_deref())
        .map_err(|reason| AppError::InvalidMessage(reason.to_string()))?;

    let conversation = state
        .store
        .conversation(conversation_id)
        .await?
        .ok_or(AppError::NotFound("conversation"))?;
    let membership = state
        .store
        .membership(conversation_id, user)
        .await?
        .ok_or(AppError::Forbidden("not a member of this conversation"))?;
    if conversation.is_channel() && !membership.is_admin() {
        return Err(AppError::Forbidden("only channel admins may send"));
    }

    let now = Utc::now();
    let outcome = state
        .store
        .upsert_message(
            id,
            conversation_id,
            user,
            content.as_deref(),
            kind,
            reply_to_id,
            now,
        )
        .await?;

    let (created_at, inserted) = match outcome {
        UpsertOutcome::Inserted { created_at } => (created_at, true),
        UpsertOutcome::Existing {
            conversation_id: existing_conversation,
            sender_id: existing_sender,
            created_at,
        } => {
            // Retries must carry the same binding; anything else is an id
            // collision and is rejected.
            if existing_conversation != conversation_id || existing_sender != user {
                return Err(AppError::Conflict("message id already bound elsewhere"));
            }
            (created_at, false)
        }
    };

    if inserted {
        if let Some(ids) = attachment_ids.as_deref() {
            state.store.link_attachments(id, ids).await?;
        }
    }

    // Load before acking so every fallible persist step precedes the ack.
    let dto = if inserted {
        Some(
            state
                .store
                .load_message_dto(id, now)
                .await?
                .ok_or_else(|| AppError::Internal("freshly inserted message not found".into()))?,
        )
    } else {
        None
    };

    send_to_session(
        state,
        session,
        &ServerEvent::MessageAck {
            id,
            status: AckStatus::Ok,
            timestamp: Some(created_at),
            error: None,
        },
    );

    let Some(dto) = dto else {
        // Idempotent retry: one row, one broadcast — this was the second ack.
        return Ok(());
    };

    publish(state, conversation_id, &ServerEvent::NewMessage(dto)).await;

    // The message is durably sent; the delivered transition must not turn a
    // successful send into an error ack.
    if let Err(e) = advance_delivered(state, &conversation, id, user).await {
        tracing::warn!(message = %id, error = %e, "Delivered transition failed");
    }
    Ok(())
}

/// Non-channel only: if any other member is inside the presence window,
/// advance the message to `delivered` (guarded, fires once) and broadcast
/// the receipt.
async fn advance_delivered(
    state: &AppState,
    conversation: &crate::store::ConversationRow,
    message_id: Uuid,
    sender: Uuid,
) -> Result<()> {
    if conversation.is_channel() {
        return Ok(());
    }

    let now = Utc::now();
    let online = state
        .store
        .any_other_member_online(conversation.id, sender, presence::window_start(now))
        .await?;
    if !online {
        return Ok(());
    }

    if let Some(delivered_at) = state.store.mark_delivered(message_id, now).await? {
        publish(
            state,
            conversation.id,
            &ServerEvent::DeliveryReceipt {
                conversation_id: conversation.id,
                message_id,
                delivered_at,
            },
        )
        .await;
    }
    Ok(())
}

// ── Read ──────────────────────────────────────────────────────────────────────

/// Foregrounded-up-to-M: advance the member's read cursor, set `read_at`
/// under its guard (backfilling `delivered_at`), and broadcast a receipt
/// only when something actually moved. Repeats are silent no-ops.
pub async fn read(
    state: &AppState,
    user: Uuid,
    conversation_id: Uuid,
    message_id: Uuid,
) -> Result<()> {
    state
        .store
        .membership(conversation_id, user)
        .await?
        .ok_or(AppError::Forbidden("not a member of this conversation"))?;

    let meta = state
        .store
        .message_meta(message_id)
        .await?
        .ok_or(AppError::NotFound("message"))?;
    if meta.conversation_id != conversation_id {
        return Err(AppError::NotFound("message"));
    }

    let advanced = state
        .store
        .advance_last_read(conversation_id, user, message_id)
        .await?;
    let now = Utc::now();
    let marked = state.store.mark_read(message_id, user, now).await?;

    if advanced || marked.is_some() {
        // The receipt must carry the row's authoritative read_at: the value
        // this call set, or the one an earlier reader already persisted.
        publish(
            state,
            conversation_id,
            &ServerEvent::ReadReceipt {
                conversation_id,
                user_id: user,
                message_id,
                read_at: marked.or(meta.read_at).unwrap_or(now),
            },
        )
        .await;
    }
    Ok(())
}

// ── Edit / Delete ─────────────────────────────────────────────────────────────

pub async fn edit_message(
    state: &AppState,
    user: Uuid,
    id: Uuid,
    content: String,
) -> Result<()> {
    if content.trim().is_empty() {
        return Err(AppError::InvalidMessage("edited content must not be empty".into()));
    }

    let meta = state
        .store
        .message_meta(id)
        .await?
        .ok_or(AppError::NotFound("message"))?;
    if meta.sender_id != user {
        return Err(AppError::Forbidden("only the sender may edit"));
    }
    if MessageKind::parse(&meta.kind) != Some(MessageKind::Text) {
        return Err(AppError::Conflict("only text messages can be edited"));
    }
    if meta.deleted_at.is_some() {
        return Err(AppError::Conflict("message was deleted"));
    }
    let now = Utc::now();
    if !edit_window_open(meta.created_at, now) {
        return Err(AppError::Conflict("edit window expired"));
    }

    // The update re-checks everything; losing the race to the window edge
    // or a concurrent delete surfaces as a conflict.
    let window_start = now - Duration::seconds(EDIT_WINDOW_SECS);
    let Some((conversation_id, edited_at)) = state
        .store
        .edit_message(id, user, &content, now, window_start)
        .await?
    else {
        return Err(AppError::Conflict("edit window expired"));
    };

    publish(
        state,
        conversation_id,
        &ServerEvent::MessageUpdated {
            id,
            conversation_id,
            content,
            edited_at,
        },
    )
    .await;
    Ok(())
}

pub async fn delete_message(state: &AppState, user: Uuid, id: Uuid) -> Result<()> {
    let meta = state
        .store
        .message_meta(id)
        .await?
        .ok_or(AppError::NotFound("message"))?;
    if meta.sender_id != user {
        return Err(AppError::Forbidden("only the sender may delete"));
    }

    let now = Utc::now();
    match state.store.soft_delete(id, user, now).await? {
        Some(conversation_id) => {
            publish(
                state,
                conversation_id,
                &ServerEvent::MessageDeleted {
                    id,
                    conversation_id,
                },
            )
            .await;
        }
        // Already tombstoned: deleting twice is a no-op, not an error.
        None => {}
    }
    Ok(())
}

// ── Reactions / Typing ────────────────────────────────────────────────────────

pub async fn react(
    state: &AppState,
    user: Uuid,
    message_id: Uuid,
    emoji: Option<String>,
) -> Result<()> {
    let meta = state
        .store
        .message_meta(message_id)
        .await?
        .ok_or(AppError::NotFound("message"))?;
    state
        .store
        .membership(meta.conversation_id, user)
        .await?
        .ok_or(AppError::Forbidden("not a member of this conversation"))?;

    match emoji.as_deref() {
        Some(value) => {
            validate_emoji(value)
                .map_err(|reason| AppError::InvalidMessage(reason.to_string()))?;
            state
                .store
                .set_reaction(message_id, user, value, Utc::now())
                .await?;
        }
        None => {
            state.store.clear_reaction(message_id, user).await?;
        }
    }

    publish(
        state,
        meta.conversation_id,
        &ServerEvent::ReactionUpdated {
            message_id,
            conversation_id: meta.conversation_id,
            user_id: user,
            emoji,
        },
    )
    .await;
    Ok(())
}

/// Typing is relayed on the topic with the sender's identity attached; it
/// is never persisted. Expiry and debounce are client-side.
pub async fn typing(
    state: &AppState,
    user: Uuid,
    conversation_id: Uuid,
    is_typing: bool,
) -> Result<()> {
    if !state.store.is_member(conversation_id, user).await? {
        return Err(AppError::Forbidden("not a member of this conversation"));
    }

    publish(
        state,
        conversation_id,
        &ServerEvent::Typing {
            conversation_id,
            user_id: user,
            is_typing,
        },
    )
    .await;
    Ok(())
}

// ── Presence passthrough for the handler ──────────────────────────────────────

/// Broadcast an online/offline transition for the user.
pub async fn presence_transition(
    state: &AppState,
    user: Uuid,
    status: PresenceStatus,
    last_seen_at: DateTime<Utc>,
) {
    if let Err(e) = presence::broadcast(state, user, status, last_seen_at).await {
        tracing::warn!(user = %user, error = %e, "Presence broadcast failed");
    }
}
