//! Shared application state

use crate::delivery::ChatDelivery;
use crate::registry::SessionRegistry;
use hearthlink_audit::AuditLog;
use hearthlink_auth::{IdentityDirectory, PassphraseGate, RateLimiter};
use hearthlink_core::Config;
use hearthlink_discovery::NeighborTable;
use std::sync::Arc;

/// Shared application state
pub struct AppState {
    /// Configuration
    pub config: Config,
    /// Configured users
    pub directory: Arc<IdentityDirectory>,
    /// Live connections and sessions
    pub registry: Arc<SessionRegistry>,
    /// Failed attempts per client IP, shared by the PIN and passphrase steps
    pub limiter: Arc<RateLimiter>,
    pub gate: PassphraseGate,
    pub audit: Arc<AuditLog>,
    /// IP to hardware address lookups
    pub neighbors: Arc<dyn NeighborTable>,
    /// Agent backend; chat is refused when absent
    pub delivery: Option<Arc<dyn ChatDelivery>>,
}

impl AppState {
    /// Create a new application state
    pub fn new(
        config: Config,
        directory: Arc<IdentityDirectory>,
        audit: Arc<AuditLog>,
        neighbors: Arc<dyn NeighborTable>,
    ) -> Self {
        Self {
            config,
            directory,
            registry: Arc::new(SessionRegistry::new()),
            limiter: Arc::new(RateLimiter::new()),
            gate: PassphraseGate::new(),
            audit,
            neighbors,
            delivery: None,
        }
    }

    /// Builder pattern: set the agent backend
    pub fn with_delivery(mut self, delivery: Option<Arc<dyn ChatDelivery>>) -> Self {
        self.delivery = delivery;
        self
    }

    /// Builder pattern: replace the rate limiter
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Builder pattern: replace the passphrase gate
    pub fn with_gate(mut self, gate: PassphraseGate) -> Self {
        self.gate = gate;
        self
    }

    /// Out-of-band message from the agent to an identity's live session
    pub async fn deliver_to_identity(&self, identity_id: &str, text: &str) -> bool {
        self.registry.deliver_to_identity(identity_id, text).await
    }

    /// Close every connection and stop background work
    pub async fn shutdown(&self) {
        let closed = self.registry.close_all().await;
        tracing::info!("Closed {} connection(s)", closed);
        self.audit.close();
    }
}
