//! Hardware (link-layer) addresses used as a second authentication factor

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error returned when a string is not a six-octet MAC address
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid MAC address format.")]
pub struct InvalidMacAddress;

/// A MAC address in lower-case, colon-separated form (`aa:bb:cc:dd:ee:ff`)
///
/// Deserialization only normalizes, it does not validate, so hand-edited user
/// files with odd entries still load. Use [`MacAddress::parse`] for input that
/// must be well formed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct MacAddress(String);

impl MacAddress {
    /// Normalize without validating: trim, lower-case, `-` to `:`
    pub fn normalize(raw: &str) -> Self {
        Self(raw.trim().to_lowercase().replace('-', ":"))
    }

    /// Normalize and validate
    pub fn parse(raw: &str) -> Result<Self, InvalidMacAddress> {
        let mac = Self::normalize(raw);
        if mac.is_well_formed() {
            Ok(mac)
        } else {
            Err(InvalidMacAddress)
        }
    }

    /// Find the first MAC-shaped token in a line of tool output
    pub fn find_in(line: &str) -> Option<Self> {
        line.split_whitespace().find_map(|token| Self::parse(token).ok())
    }

    /// Whether this is exactly six two-digit hex octets
    pub fn is_well_formed(&self) -> bool {
        let octets: Vec<&str> = self.0.split(':').collect();
        octets.len() == 6
            && octets
                .iter()
                .all(|o| o.len() == 2 && o.bytes().all(|b| b.is_ascii_hexdigit()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for MacAddress {
    fn from(raw: String) -> Self {
        Self::normalize(&raw)
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.0
    }
}

impl FromStr for MacAddress {
    type Err = InvalidMacAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
