//! Server configuration and shared state.

use std::sync::Arc;

use crate::bus::FanoutBus;
use crate::registry::ConnectionRegistry;
use crate::store::Store;

/// Server configuration, assembled from CLI flags / environment in `main`.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Secret for HMAC token verification.
    pub auth_secret: String,
    /// Upper bound on a single inbound WebSocket message.
    pub max_frame_bytes: usize,
    /// Capacity of each session's outbound queue.
    pub send_queue_capacity: usize,
    /// Malformed frames tolerated per session before it is closed.
    pub malformed_frame_limit: u32,
    /// How often attached users' `last_seen_at` is refreshed.
    pub presence_heartbeat_secs: u64,
    /// How often attached users are checked for a lapsed presence window.
    pub presence_sweep_secs: u64,
    /// How often expired refresh credentials are purged.
    pub credential_sweep_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            auth_secret: String::new(),
            max_frame_bytes: 64 * 1024,
            send_queue_capacity: 256,
            malformed_frame_limit: 16,
            presence_heartbeat_secs: 10,
            presence_sweep_secs: 15,
            credential_sweep_secs: 3600,
        }
    }
}

/// Shared application state, cheap to clone into every task.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<ConnectionRegistry>,
    pub store: Store,
    pub bus: FanoutBus,
}

impl AppState {
    pub fn new(config: Config, registry: Arc<ConnectionRegistry>, store: Store, bus: FanoutBus) -> Self {
        Self {
            config: Arc::new(config),
            registry,
            store,
            bus,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.max_frame_bytes, 64 * 1024);
        assert_eq!(config.send_queue_capacity, 256);
        assert_eq!(config.malformed_frame_limit, 16);
    }
}
