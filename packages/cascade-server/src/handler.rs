//! WebSocket connection handler.
//!
//! One task per connection reads frames in receive order; a writer task
//! owns the socket's send half so all writes are serialised through the
//! session's bounded queue. The auth gate runs before anything else and
//! closes with 4001 on failure.

use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use cascade_proto::{AckStatus, ClientEvent, PresenceStatus, ServerEvent, CLOSE_UNAUTHORIZED};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::{self, AccessClaims, CredentialFault};
use crate::error::AppError;
use crate::messaging::{self, send_to_session};
use crate::registry::SessionId;
use crate::state::AppState;

/// Activity bumps to `last_seen_at` are coalesced to one write per session
/// per this interval.
const LAST_SEEN_COALESCE: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub token: Option<String>,
}

/// WebSocket upgrade endpoint.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(state.config.max_frame_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state, params.token))
}

/// Verify the connect-time bearer credential.
fn authenticate(
    secret: &str,
    token: Option<&str>,
) -> Result<AccessClaims, CredentialFault> {
    let token = token.ok_or(CredentialFault::Missing)?;
    auth::verify_access_token(token, secret)
}

async fn close_unauthorized(mut socket: WebSocket, fault: CredentialFault) {
    let err = AppError::Unauthorized(fault.close_reason());
    tracing::info!(code = ?err.code(), reason = fault.close_reason(), "Closing unauthenticated session");
    let frame = CloseFrame {
        code: CLOSE_UNAUTHORIZED,
        reason: fault.close_reason().into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

/// Run one session for the lifetime of its connection.
pub async fn handle_socket(socket: WebSocket, state: AppState, token: Option<String>) {
    let claims = match authenticate(&state.config.auth_secret, token.as_deref()) {
        Ok(claims) => claims,
        Err(fault) => {
            close_unauthorized(socket, fault).await;
            return;
        }
    };
    let user = claims.user_id;
    let session: SessionId = Uuid::new_v4();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // The registry holds the only sender; when it drops the handle (detach
    // or sustained overflow) the writer drains and closes the socket.
    let (tx, mut rx) = mpsc::channel::<String>(state.config.send_queue_capacity);
    state.registry.attach(session, user, tx);

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    let now = Utc::now();
    if let Err(e) = state.store.touch_last_seen(user, now).await {
        tracing::warn!(user = %user, error = %e, "last_seen bump failed on attach");
    }
    messaging::presence_transition(&state, user, PresenceStatus::Online, now).await;
    tracing::info!(session = %session, user = %user, "Session attached");

    let mut malformed_frames = 0u32;
    let mut last_touch = Instant::now();

    while let Some(frame) = ws_receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                // Any authenticated activity counts for presence; writes
                // are coalesced so the hot path stays cheap.
                if last_touch.elapsed() >= LAST_SEEN_COALESCE {
                    last_touch = Instant::now();
                    if let Err(e) = state.store.touch_last_seen(user, Utc::now()).await {
                        tracing::warn!(user = %user, error = %e, "last_seen bump failed");
                    }
                }

                match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(ClientEvent::Unknown) => {
                        tracing::debug!(session = %session, "Ignoring unknown event type");
                    }
                    Ok(event) => dispatch(&state, session, user, event).await,
                    Err(e) => {
                        malformed_frames += 1;
                        tracing::warn!(
                            session = %session,
                            error = %e,
                            count = malformed_frames,
                            "Malformed frame"
                        );
                        send_to_session(
                            &state,
                            session,
                            &ServerEvent::Error {
                                code: cascade_proto::ErrorCode::InvalidMessage,
                                message: "malformed frame".to_string(),
                            },
                        );
                        if malformed_frames > state.config.malformed_frame_limit {
                            tracing::warn!(session = %session, "Malformed frame budget exhausted");
                            report_error(&state, session, &AppError::RateLimited);
                            break;
                        }
                    }
                }
            }
            Ok(Message::Close(_)) => {
                tracing::debug!(session = %session, "Client sent close frame");
                break;
            }
            Ok(_) => {} // Binary, Ping, Pong — the transport handles keepalive.
            Err(e) => {
                tracing::warn!(session = %session, error = %e, "WebSocket error");
                break;
            }
        }
    }

    // Cleanup: drop local indices, release emptied bus topics, broadcast
    // offline when this was the user's last local session.
    let outcome = state.registry.detach(session, user);
    for topic in outcome.emptied_topics {
        state.bus.unsubscribe(topic);
    }

    let now = Utc::now();
    if let Err(e) = state.store.touch_last_seen(user, now).await {
        tracing::warn!(user = %user, error = %e, "last_seen bump failed on detach");
    }
    if outcome.user_now_locally_offline {
        messaging::presence_transition(&state, user, PresenceStatus::Offline, now).await;
    }

    writer.abort();
    tracing::info!(session = %session, user = %user, "Session detached");
}

/// Route one parsed event. Errors are reported to this session only: sends
/// get an error ack carrying the code; everything else gets an `error`
/// event. Nothing here can affect sibling connections.
async fn dispatch(state: &AppState, session: SessionId, user: Uuid, event: ClientEvent) {
    match event {
        ClientEvent::Ping => {
            send_to_session(state, session, &ServerEvent::Pong);
        }

        ClientEvent::Subscribe { conversation_ids } => {
            if let Err(e) = messaging::subscribe(state, session, user, conversation_ids).await {
                report_error(state, session, &e);
            }
        }

        ClientEvent::Unsubscribe { conversation_ids } => {
            messaging::unsubscribe(state, session, conversation_ids);
        }

        ClientEvent::SendMessage {
            id,
            conversation_id,
            content,
            kind,
            reply_to_id,
            attachment_ids,
        } => {
            if let Err(e) = messaging::send_message(
                state,
                session,
                user,
                id,
                conversation_id,
                content,
                kind,
                reply_to_id,
                attachment_ids,
            )
            .await
            {
                tracing::warn!(op = %id, user = %user, error = %e, "Send failed");
                send_to_session(
                    state,
                    session,
                    &ServerEvent::MessageAck {
                        id,
                        status: AckStatus::Error,
                        timestamp: None,
                        error: Some(e.code()),
                    },
                );
            }
        }

        ClientEvent::EditMessage { id, content } => {
            if let Err(e) = messaging::edit_message(state, user, id, content).await {
                tracing::debug!(op = %id, user = %user, error = %e, "Edit rejected");
                report_error(state, session, &e);
            }
        }

        ClientEvent::DeleteMessage { id } => {
            if let Err(e) = messaging::delete_message(state, user, id).await {
                tracing::debug!(op = %id, user = %user, error = %e, "Delete rejected");
                report_error(state, session, &e);
            }
        }

        ClientEvent::Typing {
            conversation_id,
            is_typing,
        } => {
            if let Err(e) = messaging::typing(state, user, conversation_id, is_typing).await {
                report_error(state, session, &e);
            }
        }

        ClientEvent::Read {
            conversation_id,
            message_id,
        } => {
            if let Err(e) = messaging::read(state, user, conversation_id, message_id).await {
                report_error(state, session, &e);
            }
        }

        ClientEvent::React { message_id, emoji } => {
            if let Err(e) = messaging::react(state, user, message_id, emoji).await {
                report_error(state, session, &e);
            }
        }

        ClientEvent::Unknown => {} // Filtered before dispatch.
    }
}

fn report_error(state: &AppState, session: SessionId, err: &AppError) {
    send_to_session(
        state,
        session,
        &ServerEvent::Error {
            code: err.code(),
            message: err.client_message(),
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "handler-secret";

    #[test]
    fn test_missing_token_is_distinguished_from_invalid() {
        assert_eq!(
            authenticate(SECRET, None).unwrap_err(),
            CredentialFault::Missing
        );
        assert_eq!(
            authenticate(SECRET, Some("garbage")).unwrap_err(),
            CredentialFault::Invalid
        );
    }

    #[test]
    fn test_valid_token_binds_identity() {
        let user = Uuid::new_v4();
        let claims = AccessClaims::new(user);
        let token = auth::sign_access_token(&claims, SECRET).unwrap();

        let verified = authenticate(SECRET, Some(&token)).unwrap();
        assert_eq!(verified.user_id, user);
    }

    #[test]
    fn test_connect_params_token_is_optional() {
        let params: ConnectParams = serde_json::from_str("{}").unwrap();
        assert!(params.token.is_none());

        let params: ConnectParams = serde_json::from_str("{\"token\":\"abc\"}").unwrap();
        assert_eq!(params.token.as_deref(), Some("abc"));
    }
}
