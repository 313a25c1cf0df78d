//! Derived presence.
//!
//! Online status is never stored as a boolean: a user is online iff their
//! `last_seen_at` falls inside the presence window. Crashed instances need
//! no cleanup — their sessions decay to offline when the window lapses.

use std::collections::HashSet;

use cascade_proto::{PresenceStatus, ServerEvent, PRESENCE_WINDOW_SECS};
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::state::AppState;

/// The derived online predicate.
pub fn is_online(last_seen_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now - last_seen_at < Duration::seconds(PRESENCE_WINDOW_SECS)
}

/// Lower bound on `last_seen_at` for a user to count as online at `now`.
pub fn window_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::seconds(PRESENCE_WINDOW_SECS)
}

/// Broadcast a presence transition on every conversation the user belongs
/// to. Individual publish failures are logged, not propagated — presence is
/// derived state and heals on the next transition.
pub async fn broadcast(
    state: &AppState,
    user: Uuid,
    status: PresenceStatus,
    last_seen_at: DateTime<Utc>,
) -> Result<()> {
    let event = ServerEvent::Presence {
        user_id: user,
        status,
        last_seen_at,
    };
    let frame = serde_json::to_string(&event)?;

    for conversation in state.store.member_conversation_ids(user).await? {
        if let Err(e) = state.bus.publish(conversation, &frame).await {
            tracing::warn!(
                user = %user,
                conversation = %conversation,
                error = %e,
                "Presence publish failed"
            );
        }
    }
    Ok(())
}

/// Periodically refresh `last_seen_at` for every locally attached user, so
/// a connected-but-quiet session keeps its user inside the window
/// cluster-wide.
pub async fn heartbeat_loop(state: AppState) {
    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(state.config.presence_heartbeat_secs));
    loop {
        interval.tick().await;
        let users = state.registry.local_user_ids();
        if users.is_empty() {
            continue;
        }
        if let Err(e) = state.store.touch_many(&users, Utc::now()).await {
            tracing::warn!(error = %e, "Presence heartbeat failed");
        }
    }
}

/// Given this sweep's stale users, which offline transitions still need
/// announcing. `announced` carries users already reported offline; one that
/// re-enters the window is forgotten so a later lapse is announced again.
fn newly_stale(stale: &[Uuid], announced: &mut HashSet<Uuid>) -> Vec<Uuid> {
    announced.retain(|user| stale.contains(user));
    stale
        .iter()
        .copied()
        .filter(|user| announced.insert(*user))
        .collect()
}

/// Periodically broadcast offline transitions for users whose presence
/// window lapsed while still attached — the heartbeat normally keeps them
/// inside it, so a lapse here means their instance stopped touching them.
/// Each lapse is announced once; detached users take the normal path.
pub async fn offline_sweep_loop(state: AppState) {
    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(state.config.presence_sweep_secs));
    let mut announced: HashSet<Uuid> = HashSet::new();
    loop {
        interval.tick().await;
        let attached = state.registry.local_user_ids();
        if attached.is_empty() {
            announced.clear();
            continue;
        }

        let now = Utc::now();
        let stale = match state.store.stale_users(&attached, window_start(now)).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(error = %e, "Presence sweep failed");
                continue;
            }
        };

        let stale_ids: Vec<Uuid> = stale.iter().map(|user| user.id).collect();
        let to_announce = newly_stale(&stale_ids, &mut announced);
        for row in stale {
            if !to_announce.contains(&row.id) {
                continue;
            }
            tracing::debug!(user = %row.id, "Presence window lapsed while attached");
            if let Err(e) = broadcast(&state, row.id, PresenceStatus::Offline, row.last_seen_at).await
            {
                tracing::warn!(user = %row.id, error = %e, "Offline sweep broadcast failed");
            }
        }
    }
}
