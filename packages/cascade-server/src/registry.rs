//! Connection registry.
//!
//! Per-instance, process-local index of live sessions: which sessions a
//! user has, and which sessions are subscribed to each conversation topic.
//! This is the only structure that knows which sockets to write to on this
//! instance, and it never persists anything.
//!
//! All operations are non-blocking; contention is limited to the touched
//! DashMap shard. Outbound frames go through each session's bounded queue —
//! a session that cannot drain its queue is closed rather than buffered
//! without bound.

use std::collections::HashSet;

use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

/// Sessions whose queue stays full for this many consecutive frames are
/// closed (sustained overflow).
const OVERFLOW_CLOSE_AFTER: u32 = 8;

pub type SessionId = Uuid;

/// Pre-serialized outbound frame. Events are serialized once per broadcast
/// and the bytes cloned per receiving session.
pub type SessionSender = mpsc::Sender<String>;

struct SessionHandle {
    user_id: Uuid,
    tx: SessionSender,
    /// Consecutive frames dropped because the queue was full.
    overflow: u32,
}

/// What `detach` observed, so the caller can release bus subscriptions and
/// broadcast an offline presence transition.
#[derive(Debug, Default)]
pub struct DetachOutcome {
    /// Topics whose local subscriber set became empty.
    pub emptied_topics: Vec<Uuid>,
    /// True when the user has no remaining session on this instance.
    pub user_now_locally_offline: bool,
}

pub struct ConnectionRegistry {
    sessions: DashMap<SessionId, SessionHandle>,
    /// session → conversations it is subscribed to (reverse index so detach
    /// is O(own subscriptions)).
    subscriptions: DashMap<SessionId, HashSet<Uuid>>,
    by_user: DashMap<Uuid, HashSet<SessionId>>,
    by_conversation: DashMap<Uuid, HashSet<SessionId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            subscriptions: DashMap::new(),
            by_user: DashMap::new(),
            by_conversation: DashMap::new(),
        }
    }

    // ── Session lifecycle ─────────────────────────────────────────────────

    /// Register a session after authentication succeeded.
    pub fn attach(&self, session: SessionId, user: Uuid, tx: SessionSender) {
        self.sessions.insert(
            session,
            SessionHandle {
                user_id: user,
                tx,
                overflow: 0,
            },
        );
        self.by_user.entry(user).or_default().insert(session);
    }

    /// Remove a session from every index.
    pub fn detach(&self, session: SessionId, user: Uuid) -> DetachOutcome {
        self.sessions.remove(&session);

        let topics = self
            .subscriptions
            .remove(&session)
            .map(|(_, set)| set)
            .unwrap_or_default();

        let mut emptied = Vec::new();
        for topic in topics {
            if let Some(mut set) = self.by_conversation.get_mut(&topic) {
                set.remove(&session);
                if set.is_empty() {
                    emptied.push(topic);
                }
            }
        }
        for topic in &emptied {
            self.by_conversation.remove_if(topic, |_, set| set.is_empty());
        }

        let mut offline = false;
        if let Some(mut set) = self.by_user.get_mut(&user) {
            set.remove(&session);
            offline = set.is_empty();
        }
        if offline {
            self.by_user.remove_if(&user, |_, set| set.is_empty());
        }

        DetachOutcome {
            emptied_topics: emptied,
            user_now_locally_offline: offline,
        }
    }

    // ── Subscriptions ─────────────────────────────────────────────────────

    /// Add the session to each topic's local index. Returns the topics that
    /// gained their *first* local subscriber — those need a bus subscription.
    pub fn subscribe(&self, session: SessionId, conversations: &[Uuid]) -> Vec<Uuid> {
        let mut first = Vec::new();
        let mut subs = self.subscriptions.entry(session).or_default();
        for &conversation in conversations {
            if !subs.insert(conversation) {
                continue; // already subscribed on this session
            }
            let mut set = self.by_conversation.entry(conversation).or_default();
            let was_empty = set.is_empty();
            set.insert(session);
            if was_empty {
                first.push(conversation);
            }
        }
        first
    }

    /// Inverse of `subscribe`. Returns topics whose local subscriber set
    /// became empty — those should release their bus subscription.
    pub fn unsubscribe(&self, session: SessionId, conversations: &[Uuid]) -> Vec<Uuid> {
        let mut emptied = Vec::new();
        if let Some(mut subs) = self.subscriptions.get_mut(&session) {
            for &conversation in conversations {
                if !subs.remove(&conversation) {
                    continue;
                }
                if let Some(mut set) = self.by_conversation.get_mut(&conversation) {
                    set.remove(&session);
                    if set.is_empty() {
                        emptied.push(conversation);
                    }
                }
            }
        }
        for topic in &emptied {
            self.by_conversation.remove_if(topic, |_, set| set.is_empty());
        }
        emptied
    }

    // ── Delivery ──────────────────────────────────────────────────────────

    /// Queue a frame on one session. Returns false if the session is gone
    /// or its queue was full. Sustained overflow closes the session by
    /// dropping its sender — the writer task then shuts the socket.
    pub fn send_to_session(&self, session: SessionId, frame: &str) -> bool {
        let mut close = false;
        let delivered = match self.sessions.get_mut(&session) {
            Some(mut handle) => match handle.tx.try_send(frame.to_string()) {
                Ok(()) => {
                    handle.overflow = 0;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    handle.overflow += 1;
                    if handle.overflow >= OVERFLOW_CLOSE_AFTER {
                        close = true;
                    }
                    tracing::warn!(
                        session = %session,
                        overflow = handle.overflow,
                        "Outbound queue full, dropping frame"
                    );
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    close = true;
                    false
                }
            },
            None => false,
        };

        if close {
            // Dropping the handle drops the only sender; the writer task
            // drains and closes the socket, and the connection task runs the
            // normal detach path.
            self.sessions.remove(&session);
            tracing::warn!(session = %session, "Closing session (overflow or dead writer)");
        }

        delivered
    }

    /// Fan a frame out to every local subscriber of a topic, optionally
    /// skipping one session. Returns how many sessions it was queued on.
    pub fn send_to_conversation(
        &self,
        conversation: Uuid,
        frame: &str,
        skip: Option<SessionId>,
    ) -> usize {
        let targets: Vec<SessionId> = match self.by_conversation.get(&conversation) {
            Some(set) => set.iter().copied().collect(),
            None => return 0,
        };

        let mut delivered = 0;
        for session in targets {
            if Some(session) == skip {
                continue;
            }
            if self.send_to_session(session, frame) {
                delivered += 1;
            }
        }
        delivered
    }

    // ── Introspection ─────────────────────────────────────────────────────

    pub fn is_user_locally_online(&self, user: Uuid) -> bool {
        self.by_user
            .get(&user)
            .map(|set| !set.is_empty())
            .unwrap_or(false)
    }

    /// Users with at least one attached session on this instance.
    pub fn local_user_ids(&self) -> Vec<Uuid> {
        self.by_user.iter().map(|entry| *entry.key()).collect()
    }

    /// Topics with at least one local subscriber (the set the bus
    /// subscriber re-subscribes after a reconnect).
    pub fn active_topics(&self) -> Vec<Uuid> {
        self.by_conversation.iter().map(|entry| *entry.key()).collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn user_count(&self) -> usize {
        self.by_user.len()
    }

    pub fn topic_count(&self) -> usize {
        self.by_conversation.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attach_session(registry: &ConnectionRegistry, user: Uuid) -> (SessionId, mpsc::Receiver<String>) {
        let session = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(8);
        registry.attach(session, user, tx);
        (session, rx)
    }

    #[tokio::test]
    async fn test_attach_and_detach() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();

        let (session, _rx) = attach_session(&registry, user);
        assert!(registry.is_user_locally_online(user));
        assert_eq!(registry.session_count(), 1);

        let outcome = registry.detach(session, user);
        assert!(outcome.user_now_locally_offline);
        assert!(outcome.emptied_topics.is_empty());
        assert!(!registry.is_user_locally_online(user));
        assert_eq!(registry.session_count(), 0);
    }

    #[tokio::test]
    async fn test_user_stays_online_while_another_session_remains() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();

        let (s1, _rx1) = attach_session(&registry, user);
        let (_s2, _rx2) = attach_session(&registry, user);

        let outcome = registry.detach(s1, user);
        assert!(!outcome.user_now_locally_offline);
        assert!(registry.is_user_locally_online(user));
    }

    #[tokio::test]
    async fn test_first_subscriber_triggers_topic() {
        let registry = ConnectionRegistry::new();
        let conversation = Uuid::new_v4();
        let (s1, _rx1) = attach_session(&registry, Uuid::new_v4());
        let (s2, _rx2) = attach_session(&registry, Uuid::new_v4());

        let first = registry.subscribe(s1, &[conversation]);
        assert_eq!(first, vec![conversation]);

        // Second local subscriber: the topic is already live.
        let first = registry.subscribe(s2, &[conversation]);
        assert!(first.is_empty());

        // Re-subscribing the same session is a no-op.
        let first = registry.subscribe(s1, &[conversation]);
        assert!(first.is_empty());

        assert_eq!(registry.topic_count(), 1);
    }

    #[tokio::test]
    async fn test_last_unsubscribe_empties_topic() {
        let registry = ConnectionRegistry::new();
        let conversation = Uuid::new_v4();
        let (s1, _rx1) = attach_session(&registry, Uuid::new_v4());
        let (s2, _rx2) = attach_session(&registry, Uuid::new_v4());

        registry.subscribe(s1, &[conversation]);
        registry.subscribe(s2, &[conversation]);

        assert!(registry.unsubscribe(s1, &[conversation]).is_empty());
        assert_eq!(registry.unsubscribe(s2, &[conversation]), vec![conversation]);
        assert_eq!(registry.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_detach_reports_emptied_topics() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();
        let c1 = Uuid::new_v4();
        let c2 = Uuid::new_v4();
        let (s1, _rx1) = attach_session(&registry, user);
        let (s2, _rx2) = attach_session(&registry, Uuid::new_v4());

        registry.subscribe(s1, &[c1, c2]);
        registry.subscribe(s2, &[c2]);

        let outcome = registry.detach(s1, user);
        // c1 emptied; c2 still has s2.
        assert_eq!(outcome.emptied_topics, vec![c1]);
        assert_eq!(registry.topic_count(), 1);
    }

    #[tokio::test]
    async fn test_send_to_conversation_skips_excluded_session() {
        let registry = ConnectionRegistry::new();
        let conversation = Uuid::new_v4();
        let (s1, mut rx1) = attach_session(&registry, Uuid::new_v4());
        let (s2, mut rx2) = attach_session(&registry, Uuid::new_v4());

        registry.subscribe(s1, &[conversation]);
        registry.subscribe(s2, &[conversation]);

        let delivered = registry.send_to_conversation(conversation, "{\"type\":\"pong\"}", Some(s1));
        assert_eq!(delivered, 1);
        assert!(rx1.try_recv().is_err());
        assert_eq!(rx2.try_recv().unwrap(), "{\"type\":\"pong\"}");
    }

    #[tokio::test]
    async fn test_send_to_unknown_session_returns_false() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.send_to_session(Uuid::new_v4(), "x"));
    }

    #[tokio::test]
    async fn test_sustained_overflow_closes_session() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();
        let session = Uuid::new_v4();
        // Capacity-1 queue that nothing drains.
        let (tx, _rx) = mpsc::channel(1);
        registry.attach(session, user, tx);

        assert!(registry.send_to_session(session, "first"));
        for _ in 0..OVERFLOW_CLOSE_AFTER {
            assert!(!registry.send_to_session(session, "overflow"));
        }
        // The handle was dropped; the session is gone.
        assert_eq!(registry.session_count(), 0);
        assert!(!registry.send_to_session(session, "late"));
    }

    #[tokio::test]
    async fn test_active_topics_reflect_subscriptions() {
        let registry = ConnectionRegistry::new();
        let c1 = Uuid::new_v4();
        let c2 = Uuid::new_v4();
        let (s1, _rx) = attach_session(&registry, Uuid::new_v4());

        registry.subscribe(s1, &[c1, c2]);
        let mut topics = registry.active_topics();
        topics.sort();
        let mut expected = vec![c1, c2];
        expected.sort();
        assert_eq!(topics, expected);
    }
}
