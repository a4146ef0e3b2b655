//! Hearthlink Server - Axum-based HTTP and WebSocket server
//!
//! This crate wires the authentication, audit and discovery crates into the
//! per-connection protocol and serves it over WebSockets.

pub mod connection;
pub mod delivery;
pub mod http;
pub mod registry;
pub mod state;
pub mod websocket;

pub use connection::{ConnectionProtocol, ConnectionState};
pub use delivery::{ChatContext, ChatDelivery, CommandDelivery, DeliveryError, DeliveryEvent};
pub use http::create_router;
pub use registry::{ConnectionHandle, ConnectionId, Outbound, SessionRegistry};
pub use state::AppState;
