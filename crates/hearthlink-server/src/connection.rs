//! Per-connection protocol state machine
//!
//! ```text
//! Unauthenticated --pin ok--> Authenticated
//!        |   ^
//!   pin ok,  | wrong passphrase, timeout, locked out
//!  gate on   |
//!        v   |
//! PendingSecondFactor --passphrase ok--> Authenticated
//! ```
//!
//! Every state ends in `Closed` when the transport goes away. Frames of one
//! connection are handled strictly in order by its socket task.

use crate::delivery::{ChatContext, DeliveryError, DeliveryEvent};
use crate::registry::ConnectionHandle;
use crate::state::AppState;
use chrono::Utc;
use hearthlink_auth::{Identity, IdentityDirectory, PendingSecondFactor};
use hearthlink_core::protocol::{
    AuditEntry, AuditQuery, ChatEventKind, Direction, Role, UserInfo, UserSummary,
};
use hearthlink_core::{ClientFrame, Error, MacAddress, Result, ServerFrame};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Where a connection is in the login flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Unauthenticated,
    PendingSecondFactor(PendingSecondFactor),
    Authenticated(Identity),
    Closed,
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Unauthenticated => "unauthenticated",
            ConnectionState::PendingSecondFactor(_) => "pending_second_factor",
            ConnectionState::Authenticated(_) => "authenticated",
            ConnectionState::Closed => "closed",
        }
    }
}

/// One browser connection
pub struct ConnectionProtocol {
    app: Arc<AppState>,
    handle: ConnectionHandle,
    source: String,
    hardware_address: Option<MacAddress>,
    state: ConnectionState,
}

impl ConnectionProtocol {
    /// Register the connection and greet the client
    pub async fn open(app: Arc<AppState>, handle: ConnectionHandle, source: &str) -> Self {
        app.registry.add_connection(handle.clone(), source).await;
        handle.send(ServerFrame::Welcome {
            version: env!("CARGO_PKG_VERSION").to_string(),
        });
        info!("Client connected from {} ({})", source, handle.id());

        Self {
            app,
            handle,
            source: source.to_string(),
            hardware_address: None,
            state: ConnectionState::Unauthenticated,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Parse and handle one text frame
    pub async fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<ClientFrame>(text) {
            Ok(frame) => self.handle_frame(frame).await,
            Err(e) => {
                warn!("Invalid frame from {}: {}", self.source, e);
                self.send(ServerFrame::error(&Error::InvalidFrame));
            }
        }
    }

    pub async fn handle_frame(&mut self, frame: ClientFrame) {
        if self.state == ConnectionState::Closed {
            return;
        }
        debug!("{} frame in state {}", frame.kind(), self.state.name());

        match frame {
            ClientFrame::Auth { pin } => self.handle_auth(&pin).await,
            ClientFrame::Passphrase { passphrase } => self.handle_passphrase(&passphrase).await,
            ClientFrame::ChatMessage { text } => self.handle_chat(&text).await,
            ClientFrame::AuditQuery(query) => self.handle_audit_query(&query).await,
            ClientFrame::AdminGetUsers => {
                if let Some(denied) = self.require_admin().await {
                    self.send(denied);
                    return;
                }
                let users = self.app.directory.summaries().await;
                self.send(ServerFrame::AdminUsersResult { users });
            }
            ClientFrame::AdminLanScan => {
                if let Some(denied) = self.require_admin().await {
                    self.send(denied);
                    return;
                }
                let devices = self.app.neighbors.scan().await;
                self.send(ServerFrame::AdminLanScanResult {
                    devices,
                    current_mac: self.hardware_address.clone(),
                });
            }
            ClientFrame::AdminUpdateUser { user_id, updates } => {
                self.admin(|dir| async move { dir.update_user(&user_id, updates).await })
                    .await
            }
            ClientFrame::AdminAddMac { user_id, mac } => {
                self.admin(|dir| async move { dir.add_mac(&user_id, &mac).await })
                    .await
            }
            ClientFrame::AdminRemoveMac { user_id, mac } => {
                self.admin(|dir| async move { dir.remove_mac(&user_id, &mac).await })
                    .await
            }
            ClientFrame::AdminAddCurrentDevice { user_id } => {
                let current = self.hardware_address.clone();
                self.admin(|dir| async move {
                    dir.add_current_device(&user_id, current.as_ref()).await
                })
                .await
            }
            ClientFrame::AdminAddUser { user } => {
                self.admin(|dir| async move { dir.add_user(user).await })
                    .await
            }
            ClientFrame::AdminRemoveUser { user_id } => {
                let acting = self.identity().map(|i| i.id.clone()).unwrap_or_default();
                self.admin(|dir| async move { dir.remove_user(&user_id, &acting).await })
                    .await
            }
        }
    }

    /// Transport closed
    pub async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.app.registry.remove_connection(self.handle.id()).await;
        self.state = ConnectionState::Closed;
        info!("Client disconnected from {} ({})", self.source, self.handle.id());
    }

    async fn handle_auth(&mut self, pin: &str) {
        match &self.state {
            ConnectionState::Authenticated(identity) => {
                debug!("{} sent auth while logged in", identity.id);
                self.send(ServerFrame::auth_failed(&Error::validation(
                    "Already authenticated.",
                )));
                return;
            }
            ConnectionState::PendingSecondFactor(pending) => {
                debug!("Restarting login, discarding pending {}", pending.identity.id);
                self.state = ConnectionState::Unauthenticated;
            }
            _ => {}
        }

        // Held across the address lookup so parallel sockets from one
        // source cannot outrun the failure count
        let attempt = match self.app.limiter.begin(&self.source) {
            Ok(attempt) => attempt,
            Err(e) => {
                self.send(ServerFrame::auth_failed(&e));
                return;
            }
        };

        let mac = self.app.neighbors.resolve(&self.source).await;
        debug!(
            "Auth attempt from {} (MAC: {})",
            self.source,
            mac.as_ref().map(MacAddress::as_str).unwrap_or("unknown")
        );

        let outcome = self.app.directory.authenticate(pin, mac.as_ref()).await;
        match outcome.into_result() {
            Ok((identity, reason)) if self.app.gate.applies_to(&identity) => {
                info!("PIN OK for {}, awaiting passphrase", identity.name);
                let pending = self.app.gate.begin(identity, mac);
                self.send(ServerFrame::PassphrasePrompt {
                    user_name: pending.user_name().to_string(),
                });
                debug!("First factor for {}: {}", pending.identity.id, reason);
                self.state = ConnectionState::PendingSecondFactor(pending);
                drop(attempt);
            }
            Ok((identity, reason)) => {
                attempt.succeed();
                self.complete_login(identity, mac, reason.as_str()).await
            }
            Err(e) => {
                attempt.fail();
                info!("Auth FAILED from {}: {}", self.source, e.code());
                self.send(ServerFrame::auth_failed(&e));
            }
        }
    }

    async fn handle_passphrase(&mut self, passphrase: &str) {
        let pending = match std::mem::replace(&mut self.state, ConnectionState::Unauthenticated) {
            ConnectionState::PendingSecondFactor(pending) => pending,
            other => {
                self.state = other;
                self.send(ServerFrame::passphrase_error(&Error::NoPendingAuthentication));
                return;
            }
        };

        let verified = self
            .app
            .gate
            .verify(pending, passphrase, &self.app.limiter, &self.source);
        match verified {
            Ok(verified) => {
                self.complete_login(verified.identity, verified.hardware_address, "passphrase")
                    .await
            }
            Err(e) => self.send(ServerFrame::passphrase_error(&e)),
        }
    }

    async fn complete_login(
        &mut self,
        identity: Identity,
        mac: Option<MacAddress>,
        via: &str,
    ) {
        self.app.limiter.clear(&self.source);
        let info = identity.info();
        self.app
            .registry
            .promote(self.handle.id(), info.clone(), mac.clone())
            .await;
        self.hardware_address = mac;

        info!("Auth OK: {} ({})", identity.name, via);
        self.send(ServerFrame::auth_ok(info));
        self.state = ConnectionState::Authenticated(identity);
    }

    async fn handle_chat(&self, text: &str) {
        let Some(identity) = self.identity() else {
            self.send(ServerFrame::error(&Error::NotAuthenticated));
            return;
        };
        let text = text.trim();
        if text.is_empty() {
            return;
        }

        let user = identity.info();
        let context = ChatContext::new(&user, text);
        debug!("Inbound from {}: {}", user.name, preview(text, 50));

        if user.role == Role::Child {
            self.audit(Direction::Inbound, &user, &context.session_key, text)
                .await;
        }

        self.send(ServerFrame::chat(ChatEventKind::Thinking, "Thinking"));

        let Some(delivery) = self.app.delivery.clone() else {
            error!("No chat delivery configured");
            self.send(ServerFrame::chat(
                ChatEventKind::Error,
                Error::InternalUnavailable("dispatch API".to_string()).to_string(),
            ));
            return;
        };

        info!("Dispatching to agent {} with session key {}", user.agent, context.session_key);
        let session_key = context.session_key.clone();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let forward = async {
            let mut reply = None;
            while let Some(event) = rx.recv().await {
                match event {
                    DeliveryEvent::Tool(text) => {
                        self.send(ServerFrame::chat(ChatEventKind::Tool, text));
                    }
                    DeliveryEvent::Block(text) => {
                        self.send(ServerFrame::chat(ChatEventKind::Token, text));
                    }
                    DeliveryEvent::Final(text) => reply = Some(text),
                }
            }
            reply
        };

        let timeout = self.app.config.agent_timeout();
        let result = tokio::time::timeout(timeout, async {
            tokio::join!(delivery.deliver(context, tx), forward)
        })
        .await;

        let result = match result {
            Ok((result, Some(reply))) => {
                if user.role == Role::Child {
                    self.audit(Direction::Outbound, &user, &session_key, &reply)
                        .await;
                }
                self.send(ServerFrame::chat(ChatEventKind::Done, reply));
                result
            }
            Ok((result, None)) => result,
            Err(_) => {
                warn!("Agent {} gave no reply to {} within {:?}", user.agent, user.id, timeout);
                Err(DeliveryError::TimedOut(timeout.as_secs()))
            }
        };
        if let Err(e) = result {
            error!("Dispatch failed for {}: {}", user.id, e);
            self.send(ServerFrame::chat(ChatEventKind::Error, format!("Agent error: {}", e)));
        }
    }

    async fn handle_audit_query(&self, query: &AuditQuery) {
        let Some(identity) = self.identity() else {
            self.send(ServerFrame::error(&Error::NotAuthenticated));
            return;
        };
        if !identity.role.is_privileged() || !self.holds_session(&identity.id).await {
            warn!("Audit query refused for {}", identity.id);
            self.send(ServerFrame::error(&Error::AccessDenied(
                "Audit access denied.".to_string(),
            )));
            return;
        }

        let entries = self.app.audit.query(query).await;
        let count = entries.len();
        self.send(ServerFrame::AuditResult { entries, count });
    }

    /// Run a directory mutation for a parent or admin and report the result
    async fn admin<F, Fut>(&self, op: F)
    where
        F: FnOnce(Arc<IdentityDirectory>) -> Fut,
        Fut: Future<Output = Result<Vec<UserSummary>>>,
    {
        if let Some(denied) = self.require_admin().await {
            self.send(denied);
            return;
        }

        match op(self.app.directory.clone()).await {
            Ok(users) => self.send(ServerFrame::admin_ok(users)),
            Err(e) => {
                warn!("Admin request failed: {}", e);
                self.send(ServerFrame::admin_failed(&e));
            }
        }
    }

    /// `Some(refusal)` unless a parent or admin is logged in on this
    /// connection and has not been replaced by a newer login
    async fn require_admin(&self) -> Option<ServerFrame> {
        let denied = Some(ServerFrame::admin_failed(&Error::access_denied()));
        let Some(identity) = self.identity() else {
            return denied;
        };
        if !identity.role.is_privileged() {
            return denied;
        }
        if !self.holds_session(&identity.id).await {
            warn!("{} on {} was replaced; refusing admin request", identity.id, self.handle.id());
            return denied;
        }
        None
    }

    /// Whether the registry's live session for `identity_id` is this connection
    async fn holds_session(&self, identity_id: &str) -> bool {
        self.app
            .registry
            .find_by_identity(identity_id)
            .await
            .is_some_and(|session| session.id == self.handle.id())
    }

    fn identity(&self) -> Option<&Identity> {
        match &self.state {
            ConnectionState::Authenticated(identity) => Some(identity),
            _ => None,
        }
    }

    async fn audit(&self, dir: Direction, user: &UserInfo, session_key: &str, text: &str) {
        let entry = AuditEntry::new(Utc::now().timestamp_millis(), dir, user, session_key, text);
        if let Err(e) = self.app.audit.append(&entry).await {
            error!("Failed to write audit entry: {}", e);
        }
    }

    fn send(&self, frame: ServerFrame) {
        if !self.handle.send(frame) {
            debug!("Dropping frame for closed connection {}", self.handle.id());
        }
    }
}

fn preview(text: &str, chars: usize) -> String {
    text.chars().take(chars).collect()
}
