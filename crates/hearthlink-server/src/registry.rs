//! Live connections and the single session per identity

use chrono::{DateTime, Utc};
use hearthlink_core::protocol::{ChatEventKind, UserInfo};
use hearthlink_core::{MacAddress, ServerFrame};
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

/// Close code sent to a connection whose identity logged in elsewhere
pub const CLOSE_REPLACED: u16 = 4001;

/// Close code sent to every connection on shutdown
pub const CLOSE_SHUTDOWN: u16 = 1001;

/// Unique identifier for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Generate a new random connection ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message queued for a connection's socket writer
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(ServerFrame),
    Close { code: u16, reason: String },
}

/// Sending half of a connection's socket
///
/// Sends never block and never fail loudly: once the writer is gone they
/// just report `false`.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    /// Create a handle and the receiver its socket writer drains
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            id: ConnectionId::new(),
            tx,
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn send(&self, frame: ServerFrame) -> bool {
        self.tx.send(Outbound::Frame(frame)).is_ok()
    }

    pub fn close(&self, code: u16, reason: &str) -> bool {
        self.tx
            .send(Outbound::Close {
                code,
                reason: reason.to_string(),
            })
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A registered connection
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub handle: ConnectionHandle,
    /// Client IP address
    pub source: String,
    pub hardware_address: Option<MacAddress>,
    pub connected_at: DateTime<Utc>,
    /// Set once the connection is promoted
    pub identity: Option<UserInfo>,
}

#[derive(Default)]
struct Tables {
    connections: HashMap<ConnectionId, Connection>,
    /// identity id -> the connection holding its session
    sessions: HashMap<String, ConnectionId>,
}

/// Every live connection, and which one holds each identity's session
#[derive(Default)]
pub struct SessionRegistry {
    tables: RwLock<Tables>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new unauthenticated connection
    pub async fn add_connection(&self, handle: ConnectionHandle, source: &str) -> Connection {
        let connection = Connection {
            id: handle.id(),
            handle,
            source: source.to_string(),
            hardware_address: None,
            connected_at: Utc::now(),
            identity: None,
        };

        let mut tables = self.tables.write().await;
        tables.connections.insert(connection.id, connection.clone());
        debug!("Connection {} registered from {}", connection.id, source);
        connection
    }

    /// Bind `identity` to connection `id`, replacing any other session for it
    ///
    /// Returns false if the connection is not registered.
    pub async fn promote(
        &self,
        id: ConnectionId,
        identity: UserInfo,
        hardware_address: Option<MacAddress>,
    ) -> bool {
        let mut tables = self.tables.write().await;
        let Tables {
            connections,
            sessions,
        } = &mut *tables;

        let Some(connection) = connections.get_mut(&id) else {
            return false;
        };
        connection.identity = Some(identity.clone());
        connection.hardware_address = hardware_address;
        let source = connection.source.clone();

        if let Some(previous) = sessions.insert(identity.id.clone(), id) {
            if previous != id {
                if let Some(old) = connections.get_mut(&previous) {
                    debug!("Replacing existing session for {}", identity.id);
                    old.handle.close(CLOSE_REPLACED, "replaced");
                    old.identity = None;
                }
            }
        }

        info!(
            "Session authenticated: {} ({}) from {}",
            identity.name, identity.id, source
        );
        true
    }

    /// Forget a connection, and its session if it still holds one
    pub async fn remove_connection(&self, id: ConnectionId) -> Option<Connection> {
        let mut tables = self.tables.write().await;
        let connection = tables.connections.remove(&id)?;

        if let Some(identity) = &connection.identity {
            if tables.sessions.get(&identity.id) == Some(&id) {
                tables.sessions.remove(&identity.id);
                info!("Session closed: {}", identity.name);
            }
        }
        Some(connection)
    }

    pub async fn get(&self, id: ConnectionId) -> Option<Connection> {
        self.tables.read().await.connections.get(&id).cloned()
    }

    /// The connection currently holding `identity_id`'s session
    pub async fn find_by_identity(&self, identity_id: &str) -> Option<Connection> {
        let tables = self.tables.read().await;
        let id = tables.sessions.get(identity_id)?;
        tables.connections.get(id).cloned()
    }

    /// Best-effort send to an identity's live session
    pub async fn send_to_identity(&self, identity_id: &str, frame: ServerFrame) -> bool {
        match self.find_by_identity(identity_id).await {
            Some(connection) => connection.handle.send(frame),
            None => {
                debug!("No live session for {}", identity_id);
                false
            }
        }
    }

    /// Push agent-initiated text to an identity
    pub async fn deliver_to_identity(&self, identity_id: &str, text: &str) -> bool {
        self.send_to_identity(identity_id, ServerFrame::chat(ChatEventKind::AgentPush, text))
            .await
    }

    /// Close every connection and empty the registry; returns how many were closed
    pub async fn close_all(&self) -> usize {
        let mut tables = self.tables.write().await;
        let count = tables.connections.len();
        for connection in tables.connections.values() {
            connection.handle.close(CLOSE_SHUTDOWN, "server shutdown");
        }
        tables.connections.clear();
        tables.sessions.clear();
        count
    }

    /// Authenticated sessions
    pub async fn active_count(&self) -> usize {
        self.tables.read().await.sessions.len()
    }

    /// All connections, authenticated or not
    pub async fn total_count(&self) -> usize {
        self.tables.read().await.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearthlink_core::protocol::Role;

    fn user(id: &str) -> UserInfo {
        UserInfo {
            id: id.to_string(),
            name: id.to_uppercase(),
            agent: "main".to_string(),
            role: Role::Child,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn test_second_login_replaces_first() {
        let registry = SessionRegistry::new();
        let (first, mut first_rx) = ConnectionHandle::channel();
        let (second, mut second_rx) = ConnectionHandle::channel();

        registry.add_connection(first.clone(), "10.0.0.2").await;
        registry.add_connection(second.clone(), "10.0.0.3").await;

        assert!(registry.promote(first.id(), user("c1"), None).await);
        assert!(registry.promote(second.id(), user("c1"), None).await);

        assert_eq!(registry.active_count().await, 1);
        assert_eq!(registry.total_count().await, 2);
        assert_eq!(registry.find_by_identity("c1").await.unwrap().id, second.id());

        assert_eq!(
            drain(&mut first_rx),
            vec![Outbound::Close {
                code: CLOSE_REPLACED,
                reason: "replaced".into()
            }]
        );
        assert!(drain(&mut second_rx).is_empty());

        // The evicted connection going away must not drop the live session
        registry.remove_connection(first.id()).await;
        assert_eq!(registry.find_by_identity("c1").await.unwrap().id, second.id());

        registry.remove_connection(second.id()).await;
        assert!(registry.find_by_identity("c1").await.is_none());
        assert_eq!(registry.total_count().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_logins_leave_one_session() {
        for _ in 0..50 {
            let registry = std::sync::Arc::new(SessionRegistry::new());
            let (first, mut first_rx) = ConnectionHandle::channel();
            let (second, mut second_rx) = ConnectionHandle::channel();
            registry.add_connection(first.clone(), "10.0.0.2").await;
            registry.add_connection(second.clone(), "10.0.0.3").await;

            let logins: Vec<_> = [first.id(), second.id()]
                .into_iter()
                .map(|id| {
                    let registry = registry.clone();
                    tokio::spawn(async move { registry.promote(id, user("c1"), None).await })
                })
                .collect();
            for login in logins {
                assert!(login.await.unwrap());
            }

            assert_eq!(registry.active_count().await, 1);
            let winner = registry.find_by_identity("c1").await.unwrap().id;

            let first_closed = drain(&mut first_rx);
            let second_closed = drain(&mut second_rx);
            assert_eq!(first_closed.len() + second_closed.len(), 1);
            let loser_closed = if winner == first.id() {
                second_closed
            } else {
                first_closed
            };
            assert_eq!(
                loser_closed,
                vec![Outbound::Close {
                    code: CLOSE_REPLACED,
                    reason: "replaced".into()
                }]
            );
        }
    }

    #[tokio::test]
    async fn test_promote_twice_same_connection() {
        let registry = SessionRegistry::new();
        let (handle, mut rx) = ConnectionHandle::channel();
        registry.add_connection(handle.clone(), "10.0.0.2").await;

        registry.promote(handle.id(), user("c1"), None).await;
        registry.promote(handle.id(), user("c1"), None).await;
        assert!(drain(&mut rx).is_empty());
        assert_eq!(registry.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_promote_unknown_connection() {
        let registry = SessionRegistry::new();
        assert!(!registry.promote(ConnectionId::new(), user("c1"), None).await);
        assert_eq!(registry.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_send_to_identity() {
        let registry = SessionRegistry::new();
        let (handle, mut rx) = ConnectionHandle::channel();
        registry.add_connection(handle.clone(), "10.0.0.2").await;

        assert!(!registry.deliver_to_identity("c1", "hi").await);

        let mac = MacAddress::parse("aa:bb:cc:dd:ee:ff").unwrap();
        registry.promote(handle.id(), user("c1"), Some(mac.clone())).await;
        assert_eq!(registry.get(handle.id()).await.unwrap().hardware_address, Some(mac));

        assert!(registry.deliver_to_identity("c1", "hi").await);
        assert_eq!(
            drain(&mut rx),
            vec![Outbound::Frame(ServerFrame::chat(ChatEventKind::AgentPush, "hi"))]
        );

        // Writer gone: no panic, just false
        drop(rx);
        assert!(!registry.deliver_to_identity("c1", "again").await);
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = SessionRegistry::new();
        let (a, mut a_rx) = ConnectionHandle::channel();
        let (b, mut b_rx) = ConnectionHandle::channel();
        registry.add_connection(a.clone(), "10.0.0.2").await;
        registry.add_connection(b, "10.0.0.3").await;
        registry.promote(a.id(), user("c1"), None).await;

        assert_eq!(registry.close_all().await, 2);
        assert_eq!(registry.total_count().await, 0);
        assert_eq!(registry.active_count().await, 0);

        let shutdown = Outbound::Close {
            code: CLOSE_SHUTDOWN,
            reason: "server shutdown".into(),
        };
        assert_eq!(drain(&mut a_rx), vec![shutdown.clone()]);
        assert_eq!(drain(&mut b_rx), vec![shutdown]);
    }
}
