//! Cascade realtime messaging server.
//!
//! The realtime core of a multi-user chat platform:
//!
//! 1. **Sessions**: persistent WebSocket connections, authenticated at
//!    connect time, with per-operation authorisation against conversation
//!    membership.
//!
//! 2. **Message lifecycle**: every message and state transition is
//!    persisted first; `delivered_at` / `read_at` live in the message row
//!    and only ever move forward.
//!
//! 3. **Fan-out**: events are published on a per-conversation redis topic
//!    so any instance can deliver to its locally attached subscribers.

pub mod auth;
pub mod bus;
pub mod error;
pub mod handler;
pub mod messaging;
pub mod presence;
pub mod registry;
pub mod state;
pub mod store;

use axum::extract::State;
use axum::http::Method;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use state::AppState;

/// Build the server router: the WebSocket endpoint plus health/stats.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET])
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(handler::ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Health check endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let store_ok = state.store.readiness().await.is_ok();
    Json(json!({
        "status": if store_ok { "ok" } else { "degraded" },
        "service": "cascade-server",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Statistics endpoint.
async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "sessions": state.registry.session_count(),
        "online_users": state.registry.user_count(),
        "subscribed_topics": state.registry.topic_count(),
        "bus_subscriber_connected": state.bus.is_subscriber_connected(),
        "timestamp": Utc::now().timestamp_millis(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_json_structure() {
        let value = json!({
            "status": "ok",
            "service": "cascade-server",
            "version": env!("CARGO_PKG_VERSION"),
        });
        assert_eq!(value["status"], "ok");
        assert_eq!(value["service"], "cascade-server");
    }
}
