//! Hearthlink Core - Shared types and protocol definitions
//!
//! This crate provides the foundational types used across all Hearthlink components:
//! configuration, the error taxonomy reported to clients, hardware addresses and
//! the WebSocket frame definitions.

pub mod config;
pub mod error;
pub mod hardware;
pub mod protocol;

pub use config::Config;
pub use error::{Error, Result};
pub use hardware::MacAddress;
pub use protocol::{ClientFrame, ServerFrame};
