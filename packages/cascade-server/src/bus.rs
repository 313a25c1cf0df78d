//! Inter-instance fan-out bus.
//!
//! Topic-per-conversation pub/sub over redis. Each instance holds exactly
//! two broker connections: a multiplexed publisher shared by all handlers,
//! and one subscriber connection owned by a background task. The registry
//! drives subscribe/unsubscribe through a control channel: a topic is
//! subscribed iff at least one local session wants it.
//!
//! Bus payloads are full server-event JSON; on receipt the task writes the
//! raw bytes to every locally subscribed session. The bus has no memory of
//! past messages — durability belongs to the store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::registry::ConnectionRegistry;

const TOPIC_PREFIX: &str = "conv:";

/// The bus topic for a conversation.
pub fn topic(conversation: Uuid) -> String {
    format!("{TOPIC_PREFIX}{conversation}")
}

/// Parse a bus topic back to its conversation id.
pub fn parse_topic(channel: &str) -> Option<Uuid> {
    channel
        .strip_prefix(TOPIC_PREFIX)
        .and_then(|raw| Uuid::parse_str(raw).ok())
}

enum BusControl {
    Subscribe(Uuid),
    Unsubscribe(Uuid),
}

/// Handle to the fan-out bus, cheap to clone.
#[derive(Clone)]
pub struct FanoutBus {
    publisher: Arc<Mutex<MultiplexedConnection>>,
    ctrl_tx: mpsc::UnboundedSender<BusControl>,
    subscriber_connected: Arc<AtomicBool>,
}

impl FanoutBus {
    /// Connect the publisher and spawn the subscriber task.
    pub async fn connect(
        redis_url: &str,
        registry: Arc<ConnectionRegistry>,
    ) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        let publisher = client.get_multiplexed_async_connection().await?;

        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));

        let task_connected = connected.clone();
        tokio::spawn(async move {
            subscriber_loop(client, ctrl_rx, registry, task_connected).await;
        });

        Ok(Self {
            publisher: Arc::new(Mutex::new(publisher)),
            ctrl_tx,
            subscriber_connected: connected,
        })
    }

    /// Publish a pre-serialized server event on a conversation topic.
    pub async fn publish(&self, conversation: Uuid, payload: &str) -> Result<(), redis::RedisError> {
        let mut conn = self.publisher.lock().await;
        redis::cmd("PUBLISH")
            .arg(topic(conversation))
            .arg(payload)
            .query_async::<_, i64>(&mut *conn)
            .await?;
        Ok(())
    }

    /// Ask the subscriber task to start listening on a topic.
    pub fn subscribe(&self, conversation: Uuid) {
        let _ = self.ctrl_tx.send(BusControl::Subscribe(conversation));
    }

    /// Ask the subscriber task to stop listening on a topic.
    pub fn unsubscribe(&self, conversation: Uuid) {
        let _ = self.ctrl_tx.send(BusControl::Unsubscribe(conversation));
    }

    pub fn is_subscriber_connected(&self) -> bool {
        self.subscriber_connected.load(Ordering::Relaxed)
    }
}

/// Own the subscriber connection for the lifetime of the process,
/// reconnecting with exponential backoff and re-subscribing to every topic
/// the registry still considers live.
async fn subscriber_loop(
    client: redis::Client,
    mut ctrl_rx: mpsc::UnboundedReceiver<BusControl>,
    registry: Arc<ConnectionRegistry>,
    connected: Arc<AtomicBool>,
) {
    let mut backoff = Duration::from_secs(1);
    let max_backoff = Duration::from_secs(60);

    loop {
        match client.get_async_pubsub().await {
            Ok(mut pubsub) => {
                let mut resubscribed = true;
                for conversation in registry.active_topics() {
                    if let Err(e) = pubsub.subscribe(topic(conversation)).await {
                        tracing::warn!(error = %e, "Bus re-subscribe failed");
                        resubscribed = false;
                        break;
                    }
                }

                if resubscribed {
                    connected.store(true, Ordering::Relaxed);
                    backoff = Duration::from_secs(1);
                    tracing::info!(
                        topics = registry.topic_count(),
                        "Bus subscriber connected"
                    );

                    if let Err(e) = pump(&mut pubsub, &mut ctrl_rx, &registry).await {
                        tracing::warn!(error = %e, "Bus subscriber connection lost");
                    } else {
                        // Control channel closed: the bus handle is gone.
                        connected.store(false, Ordering::Relaxed);
                        return;
                    }
                    connected.store(false, Ordering::Relaxed);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Bus subscriber connect failed");
            }
        }

        tracing::info!(
            backoff_secs = backoff.as_secs(),
            "Reconnecting bus subscriber after backoff..."
        );
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(max_backoff);
    }
}

/// Run one connected subscriber session: interleave inbound bus messages
/// with subscribe/unsubscribe requests from the registry side.
///
/// Returns `Ok(())` only when the control channel closed (shutdown);
/// `Err` means the broker connection died and the caller should reconnect.
async fn pump(
    pubsub: &mut redis::aio::PubSub,
    ctrl_rx: &mut mpsc::UnboundedReceiver<BusControl>,
    registry: &ConnectionRegistry,
) -> Result<(), redis::RedisError> {
    loop {
        let mut pending: Option<BusControl> = None;
        let mut shutdown = false;

        {
            let stream = pubsub.on_message();
            tokio::pin!(stream);

            tokio::select! {
                maybe_msg = stream.next() => {
                    match maybe_msg {
                        Some(msg) => deliver(registry, &msg),
                        None => {
                            return Err(redis::RedisError::from((
                                redis::ErrorKind::IoError,
                                "pubsub stream ended",
                            )));
                        }
                    }
                }
                ctrl = ctrl_rx.recv() => {
                    match ctrl {
                        Some(c) => pending = Some(c),
                        None => shutdown = true,
                    }
                }
            }
        }

        if shutdown {
            return Ok(());
        }

        match pending {
            Some(BusControl::Subscribe(conversation)) => {
                pubsub.subscribe(topic(conversation)).await?;
                tracing::debug!(conversation = %conversation, "Bus topic subscribed");
            }
            Some(BusControl::Unsubscribe(conversation)) => {
                pubsub.unsubscribe(topic(conversation)).await?;
                tracing::debug!(conversation = %conversation, "Bus topic released");
            }
            None => {}
        }
    }
}

/// Write one bus message to every locally subscribed session.
fn deliver(registry: &ConnectionRegistry, msg: &redis::Msg) {
    let Some(conversation) = parse_topic(msg.get_channel_name()) else {
        tracing::warn!(channel = msg.get_channel_name(), "Bus message on unknown topic");
        return;
    };
    let payload: String = match msg.get_payload() {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(error = %e, "Bus message with non-text payload");
            return;
        }
    };

    let delivered = registry.send_to_conversation(conversation, &payload, None);
    tracing::trace!(
        conversation = %conversation,
        sessions = delivered,
        "Bus fan-out delivered"
    );
}
