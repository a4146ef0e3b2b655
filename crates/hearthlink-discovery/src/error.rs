//! Discovery error types

use thiserror::Error;

/// Errors that can occur while reading the neighbor table
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("arp not found in PATH")]
    ArpNotFound,

    #[error("arp command failed: {0}")]
    ArpCommand(String),

    #[error("arp timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Not a resolvable address: {0}")]
    InvalidAddress(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DiscoveryResult<T> = Result<T, DiscoveryError>;
