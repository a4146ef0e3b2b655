//! Identity records
//!
//! An identity is a configured household member: credentials, the devices it
//! may log in from and the agent its chat is routed to.

use hearthlink_core::protocol::{string_or_number, Role, UserInfo, UserSummary};
use hearthlink_core::MacAddress;
use serde::{Deserialize, Serialize};

/// A configured user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Unique, stable identifier (e.g. "home:dad")
    pub id: String,
    /// Display name
    pub name: String,
    /// 4-digit PIN; not unique across identities
    #[serde(deserialize_with = "string_or_number")]
    pub pin: String,
    /// Allowed hardware addresses
    #[serde(default)]
    pub mac: Vec<MacAddress>,
    /// Routing key for the chat backend
    pub agent: String,
    pub role: Role,
    /// Second factor for parents and admins
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    /// Whether the PIN is only accepted from a listed hardware address
    #[serde(default, rename = "macRequired", skip_serializing_if = "is_false")]
    pub mac_required: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Whether `pin` is exactly four ASCII digits
pub fn is_valid_pin(pin: &str) -> bool {
    pin.len() == 4 && pin.bytes().all(|b| b.is_ascii_digit())
}

impl Identity {
    /// Create an identity with no devices and no passphrase
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        pin: impl Into<String>,
        agent: impl Into<String>,
        role: Role,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            pin: pin.into(),
            mac: Vec::new(),
            agent: agent.into(),
            role,
            passphrase: None,
            mac_required: false,
        }
    }

    /// Builder pattern: set passphrase
    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    /// Builder pattern: add a hardware address
    pub fn with_mac(mut self, mac: MacAddress) -> Self {
        self.add_mac(mac);
        self
    }

    /// Builder pattern: set hardware address enforcement
    pub fn with_mac_required(mut self, required: bool) -> Self {
        self.mac_required = required;
        self
    }

    /// Clean up a record loaded from storage
    pub fn normalized(mut self) -> Self {
        if self.passphrase.as_deref().is_some_and(str::is_empty) {
            self.passphrase = None;
        }
        let mut seen = Vec::with_capacity(self.mac.len());
        for mac in self.mac.drain(..) {
            if !seen.contains(&mac) {
                seen.push(mac);
            }
        }
        self.mac = seen;
        self
    }

    /// Whether a passphrase step follows a successful PIN
    pub fn requires_passphrase(&self) -> bool {
        self.role.is_privileged() && self.passphrase.as_deref().is_some_and(|p| !p.is_empty())
    }

    /// Whether `mac` is one of this identity's devices
    pub fn has_mac(&self, mac: &MacAddress) -> bool {
        self.mac.contains(mac)
    }

    /// Add a hardware address; returns false if it was already present
    pub fn add_mac(&mut self, mac: MacAddress) -> bool {
        if self.has_mac(&mac) {
            return false;
        }
        self.mac.push(mac);
        true
    }

    /// Remove a hardware address; returns false if it was not present
    pub fn remove_mac(&mut self, mac: &MacAddress) -> bool {
        let before = self.mac.len();
        self.mac.retain(|m| m != mac);
        self.mac.len() != before
    }

    pub fn info(&self) -> UserInfo {
        UserInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            agent: self.agent.clone(),
            role: self.role,
        }
    }

    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            role: self.role,
            macs: self.mac.clone(),
            has_passphrase: self.passphrase.is_some(),
            mac_required: self.mac_required,
        }
    }
}
