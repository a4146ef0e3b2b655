//! HTTP routes
//!
//! The WebSocket endpoint plus a small JSON API for status and
//! agent-initiated pushes.

use axum::{
    extract::{ConnectInfo, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(crate::websocket::ws_handler))
        .route("/api/info", get(server_info_handler))
        .route("/api/push", post(push_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Server information response
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub version: String,
    /// Authenticated sessions
    pub active_sessions: usize,
    /// Open connections, authenticated or not
    pub connections: usize,
    /// Configured identities
    pub users: usize,
}

/// Get server information
async fn server_info_handler(State(state): State<Arc<AppState>>) -> Json<ServerInfo> {
    Json(ServerInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_sessions: state.registry.active_count().await,
        connections: state.registry.total_count().await,
        users: state.directory.len().await,
    })
}

/// Agent-initiated message for one identity
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub user_id: String,
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushResponse {
    /// Whether a live session took the message
    pub delivered: bool,
}

/// Push text to an identity's live session
///
/// Only accepted from the local host.
async fn push_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(request): Json<PushRequest>,
) -> Result<Json<PushResponse>, (StatusCode, String)> {
    if !peer.ip().to_canonical().is_loopback() {
        warn!("Push refused from {}", peer);
        return Err((StatusCode::FORBIDDEN, "Push is only accepted locally".to_string()));
    }

    let delivered = state
        .deliver_to_identity(&request.user_id, &request.text)
        .await;
    debug!("Push to {}: delivered={}", request.user_id, delivered);
    Ok(Json(PushResponse { delivered }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ConnectionHandle, Outbound};
    use hearthlink_audit::AuditLog;
    use hearthlink_auth::{Identity, IdentityDirectory, MemoryStore};
    use hearthlink_core::protocol::{ChatEventKind, Role};
    use hearthlink_core::{Config, ServerFrame};
    use hearthlink_discovery::StaticNeighbors;
    use tempfile::TempDir;

    fn app() -> (Arc<AppState>, TempDir) {
        let store = Arc::new(MemoryStore::new(vec![Identity::new(
            "c1",
            "Kid",
            "1234",
            "tutor",
            Role::Child,
        )]));
        let directory = Arc::new(IdentityDirectory::load(store).unwrap());
        let dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(AuditLog::open(dir.path(), 6).unwrap());
        let state = AppState::new(
            Config::default(),
            directory,
            audit,
            Arc::new(StaticNeighbors::new()),
        );
        (Arc::new(state), dir)
    }

    fn local() -> ConnectInfo<SocketAddr> {
        ConnectInfo("127.0.0.1:40000".parse().unwrap())
    }

    fn push(user_id: &str, text: &str) -> Json<PushRequest> {
        Json(PushRequest {
            user_id: user_id.into(),
            text: text.into(),
        })
    }

    #[tokio::test]
    async fn test_server_info() {
        let (state, _dir) = app();
        let Json(info) = server_info_handler(State(state)).await;
        assert_eq!(info.users, 1);
        assert_eq!(info.active_sessions, 0);
        assert_eq!(info.connections, 0);
    }

    #[tokio::test]
    async fn test_push_reaches_live_session() {
        let (state, _dir) = app();
        let (handle, mut rx) = ConnectionHandle::channel();
        state.registry.add_connection(handle.clone(), "10.0.0.2").await;

        let Json(resp) = push_handler(State(state.clone()), local(), push("c1", "dinner"))
            .await
            .unwrap();
        assert!(!resp.delivered);

        let user = Identity::new("c1", "Kid", "1234", "tutor", Role::Child).info();
        state.registry.promote(handle.id(), user, None).await;

        let Json(resp) = push_handler(State(state.clone()), local(), push("c1", "dinner"))
            .await
            .unwrap();
        assert!(resp.delivered);
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Frame(ServerFrame::chat(ChatEventKind::AgentPush, "dinner"))
        );
    }

    #[tokio::test]
    async fn test_push_refused_from_lan() {
        let (state, _dir) = app();
        let remote = ConnectInfo("192.168.1.40:40000".parse().unwrap());
        let err = push_handler(State(state), remote, push("c1", "hi"))
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::FORBIDDEN);
    }
}
