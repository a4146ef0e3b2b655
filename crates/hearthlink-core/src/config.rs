//! Configuration types for Hearthlink

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default WebSocket/HTTP port
pub const DEFAULT_PORT: u16 = 18790;

/// Default number of calendar months audit partitions are kept
pub const DEFAULT_RETENTION_MONTHS: u32 = 6;

/// Default limit on one chat delivery, in seconds
pub const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 120;

/// Main configuration for Hearthlink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the server binds to
    pub bind_address: String,
    /// Server port
    pub port: u16,
    /// Path to the user directory file (YAML or JSON)
    pub users_file: PathBuf,
    /// Directory holding the monthly audit partitions
    pub audit_dir: PathBuf,
    /// How many months of audit partitions to keep
    pub audit_retention_months: u32,
    /// Program that answers chat messages (None disables chat delivery)
    pub agent_command: Option<String>,
    /// Seconds a chat delivery may run before it is abandoned
    pub agent_timeout_secs: u64,
    /// TLS certificate (PEM); TLS is enabled when both cert and key are set
    pub tls_cert: Option<PathBuf>,
    /// TLS private key (PEM)
    pub tls_key: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            users_file: PathBuf::from("users.yaml"),
            audit_dir: PathBuf::from("audit"),
            audit_retention_months: DEFAULT_RETENTION_MONTHS,
            agent_command: None,
            agent_timeout_secs: DEFAULT_AGENT_TIMEOUT_SECS,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Config {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pattern: set bind address
    pub fn with_bind_address(mut self, address: impl Into<String>) -> Self {
        self.bind_address = address.into();
        self
    }

    /// Builder pattern: set port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Builder pattern: set users file
    pub fn with_users_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.users_file = path.into();
        self
    }

    /// Builder pattern: set audit directory
    pub fn with_audit_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.audit_dir = path.into();
        self
    }

    /// Builder pattern: set audit retention
    pub fn with_audit_retention_months(mut self, months: u32) -> Self {
        self.audit_retention_months = months;
        self
    }

    /// Builder pattern: set agent command
    pub fn with_agent_command(mut self, command: Option<String>) -> Self {
        self.agent_command = command;
        self
    }

    /// Builder pattern: set agent timeout
    pub fn with_agent_timeout_secs(mut self, secs: u64) -> Self {
        self.agent_timeout_secs = secs;
        self
    }

    /// Builder pattern: set TLS certificate and key
    pub fn with_tls(mut self, cert: Option<PathBuf>, key: Option<PathBuf>) -> Self {
        self.tls_cert = cert;
        self.tls_key = key;
        self
    }

    /// Both TLS files, if configured
    pub fn tls_files(&self) -> Option<(&PathBuf, &PathBuf)> {
        match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => Some((cert, key)),
            _ => None,
        }
    }

    /// Limit on one chat delivery, never below one second
    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs.max(1))
    }

    /// Socket address string for binding
    pub fn listen_address(&self) -> String {
        if self.bind_address.contains(':') {
            format!("[{}]:{}", self.bind_address, self.port)
        } else {
            format!("{}:{}", self.bind_address, self.port)
        }
    }
}
