//! Binary entry point: parse configuration, wire the store, bus, and
//! registry together, spawn the background sweepers, and serve.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;

use cascade_server::bus::FanoutBus;
use cascade_server::registry::ConnectionRegistry;
use cascade_server::state::{AppState, Config};
use cascade_server::store::Store;
use cascade_server::{build_router, presence};

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "cascade-server", version, about = "Cascade realtime messaging server")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080, env = "CASCADE_PORT")]
    port: u16,

    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Redis connection string for the fan-out bus
    #[arg(long, default_value = "redis://127.0.0.1:6379", env = "REDIS_URL")]
    redis_url: String,

    /// Shared secret for access-token verification
    #[arg(long, env = "CASCADE_AUTH_SECRET")]
    auth_secret: String,

    /// Maximum inbound WebSocket message size in bytes
    #[arg(long, default_value_t = 64 * 1024, env = "CASCADE_MAX_FRAME_BYTES")]
    max_frame_bytes: usize,

    /// Outbound queue capacity per session
    #[arg(long, default_value_t = 256, env = "CASCADE_SEND_QUEUE_CAPACITY")]
    send_queue_capacity: usize,

    /// Malformed frames tolerated per session before it is closed
    #[arg(long, default_value_t = 16, env = "CASCADE_MALFORMED_FRAME_LIMIT")]
    malformed_frame_limit: u32,

    /// How often attached users' last-seen timestamps are refreshed
    #[arg(long, default_value_t = 10, env = "CASCADE_PRESENCE_HEARTBEAT_SECS")]
    presence_heartbeat_secs: u64,

    /// How often attached users are checked for a lapsed presence window
    #[arg(long, default_value_t = 15, env = "CASCADE_PRESENCE_SWEEP_SECS")]
    presence_sweep_secs: u64,

    /// How often expired refresh credentials are purged
    #[arg(long, default_value_t = 3600, env = "CASCADE_CREDENTIAL_SWEEP_SECS")]
    credential_sweep_secs: u64,
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cascade_server=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();

    let config = Config {
        port: args.port,
        auth_secret: args.auth_secret,
        max_frame_bytes: args.max_frame_bytes,
        send_queue_capacity: args.send_queue_capacity,
        malformed_frame_limit: args.malformed_frame_limit,
        presence_heartbeat_secs: args.presence_heartbeat_secs,
        presence_sweep_secs: args.presence_sweep_secs,
        credential_sweep_secs: args.credential_sweep_secs,
    };

    let store = Store::connect(&args.database_url)
        .await
        .expect("Failed to connect to PostgreSQL");
    store.migrate().await.expect("Failed to apply store schema");

    let registry = Arc::new(ConnectionRegistry::new());
    let fanout = FanoutBus::connect(&args.redis_url, registry.clone())
        .await
        .expect("Failed to connect to redis");

    let state = AppState::new(config, registry, store, fanout);

    // Presence heartbeat: keeps attached-but-quiet users inside the window.
    let heartbeat_state = state.clone();
    tokio::spawn(async move {
        presence::heartbeat_loop(heartbeat_state).await;
    });

    // Offline sweeper: announces users whose window lapsed while attached.
    let offline_state = state.clone();
    tokio::spawn(async move {
        presence::offline_sweep_loop(offline_state).await;
    });

    // Credential sweeper: drops refresh credentials that can never validate.
    let sweep_state = state.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(sweep_state.config.credential_sweep_secs));
        loop {
            interval.tick().await;
            match sweep_state.store.purge_expired_credentials(Utc::now()).await {
                Ok(0) => {}
                Ok(purged) => tracing::debug!(count = purged, "Purged refresh credentials"),
                Err(e) => tracing::warn!(error = %e, "Credential sweep failed"),
            }
        }
    });

    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", args.port);
    tracing::info!("Cascade server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind address");

    axum::serve(listener, app).await.expect("Server error");
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse_with_env_style_flags() {
        let args = Args::try_parse_from([
            "cascade-server",
            "--database-url",
            "postgres://localhost/cascade",
            "--auth-secret",
            "s3cret",
            "--port",
            "9000",
        ])
        .unwrap();

        assert_eq!(args.port, 9000);
        assert_eq!(args.redis_url, "redis://127.0.0.1:6379");
        assert_eq!(args.max_frame_bytes, 64 * 1024);
        assert_eq!(args.malformed_frame_limit, 16);
    }

    #[test]
    fn test_short_port_flag() {
        let args = Args::try_parse_from([
            "cascade-server",
            "-p",
            "4242",
            "--database-url",
            "postgres://localhost/cascade",
            "--auth-secret",
            "s3cret",
        ])
        .unwrap();
        assert_eq!(args.port, 4242);
    }
}
