//! PIN + hardware address decision
//!
//! Declaration order in the directory breaks ties: when several identities
//! share a PIN, the first one that satisfies the hardware rule wins.

use crate::identity::Identity;
use hearthlink_core::{Error, MacAddress};
use serde::Serialize;
use tracing::warn;

/// Which rule produced an authentication result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthReason {
    /// No identity has this PIN
    InvalidPin,
    /// PIN matched and the hardware address was not checked
    PinOnly,
    /// PIN matched and the hardware address is registered
    PinAndHardware,
    /// PIN matched only identities bound to other devices
    HardwareMismatch,
}

impl AuthReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthReason::InvalidPin => "invalid_pin",
            AuthReason::PinOnly => "pin_only",
            AuthReason::PinAndHardware => "pin_and_hardware",
            AuthReason::HardwareMismatch => "hardware_mismatch",
        }
    }
}

impl std::fmt::Display for AuthReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of [`authenticate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthOutcome {
    pub identity: Option<Identity>,
    pub reason: AuthReason,
}

impl AuthOutcome {
    fn success(identity: &Identity, reason: AuthReason) -> Self {
        Self {
            identity: Some(identity.clone()),
            reason,
        }
    }

    fn failure(reason: AuthReason) -> Self {
        Self {
            identity: None,
            reason,
        }
    }

    /// Convert into the matched identity or the user-facing error
    pub fn into_result(self) -> Result<(Identity, AuthReason), Error> {
        match (self.identity, self.reason) {
            (Some(identity), reason) => Ok((identity, reason)),
            (None, AuthReason::HardwareMismatch) => Err(Error::HardwareMismatch),
            (None, _) => Err(Error::InvalidPin),
        }
    }
}

/// Decide which identity, if any, `pin` from `hardware_address` logs in as
///
/// When the hardware address could not be resolved (loopback, another
/// subnet) the first PIN match is accepted without a device check.
pub fn authenticate(
    identities: &[Identity],
    pin: &str,
    hardware_address: Option<&MacAddress>,
) -> AuthOutcome {
    let matches: Vec<&Identity> = identities.iter().filter(|i| i.pin == pin).collect();

    let Some(first) = matches.first() else {
        return AuthOutcome::failure(AuthReason::InvalidPin);
    };

    let Some(mac) = hardware_address else {
        warn!("Hardware address unresolved, falling back to PIN-only auth");
        return AuthOutcome::success(first, AuthReason::PinOnly);
    };

    for candidate in matches {
        if !candidate.mac_required {
            return AuthOutcome::success(candidate, AuthReason::PinOnly);
        }
        if candidate.has_mac(mac) {
            return AuthOutcome::success(candidate, AuthReason::PinAndHardware);
        }
    }

    AuthOutcome::failure(AuthReason::HardwareMismatch)
}
