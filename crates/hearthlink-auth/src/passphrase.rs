//! Second factor for parents and admins
//!
//! A verified PIN for an identity that [requires a passphrase] produces a
//! [`PendingSecondFactor`]. The connection holds it until the passphrase
//! arrives; [`PassphraseGate::verify`] consumes it whatever the outcome, so a
//! failed attempt always sends the user back to PIN entry.
//!
//! [requires a passphrase]: Identity::requires_passphrase

use crate::identity::Identity;
use crate::rate_limit::RateLimiter;
use hearthlink_core::{Error, MacAddress};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// How long a verified PIN waits for its passphrase
pub const PASSPHRASE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// PIN verified, passphrase still owed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSecondFactor {
    pub identity: Identity,
    pub hardware_address: Option<MacAddress>,
    pub pin_verified_at: Instant,
}

impl PendingSecondFactor {
    pub fn user_name(&self) -> &str {
        &self.identity.name
    }
}

/// Successful second factor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verified {
    pub identity: Identity,
    pub hardware_address: Option<MacAddress>,
}

/// Passphrase checker with a fixed timeout
#[derive(Debug, Clone, Copy)]
pub struct PassphraseGate {
    timeout: Duration,
}

impl Default for PassphraseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PassphraseGate {
    pub fn new() -> Self {
        Self::with_timeout(PASSPHRASE_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether `identity` must pass this gate after its PIN
    pub fn applies_to(&self, identity: &Identity) -> bool {
        identity.requires_passphrase()
    }

    /// Start waiting for the passphrase of `identity`
    pub fn begin(
        &self,
        identity: Identity,
        hardware_address: Option<MacAddress>,
    ) -> PendingSecondFactor {
        PendingSecondFactor {
            identity,
            hardware_address,
            pin_verified_at: Instant::now(),
        }
    }

    /// Check a submitted passphrase against the pending identity
    ///
    /// Order: expiry, then the rate limiter for `source`, then the
    /// comparison. Only a wrong passphrase counts as a failure.
    pub fn verify(
        &self,
        pending: PendingSecondFactor,
        submitted: &str,
        limiter: &Arc<RateLimiter>,
        source: &str,
    ) -> Result<Verified, Error> {
        if pending.pin_verified_at.elapsed() > self.timeout {
            info!("Passphrase step for {} timed out", pending.identity.name);
            return Err(Error::PassphraseExpired);
        }

        let attempt = limiter.begin(source)?;

        let matches = match pending.identity.passphrase.as_deref() {
            Some(expected) if !expected.is_empty() => {
                let submitted = submitted.trim();
                !submitted.is_empty() && submitted == expected
            }
            _ => true,
        };

        if !matches {
            attempt.fail();
            warn!(
                "Passphrase failed for {} from {}",
                pending.identity.name, source
            );
            return Err(Error::PassphraseIncorrect);
        }
        drop(attempt);

        Ok(Verified {
            identity: pending.identity,
            hardware_address: pending.hardware_address,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearthlink_core::protocol::Role;

    const IP: &str = "192.168.1.30";

    fn parent() -> Identity {
        Identity::new("p1", "Mum", "5555", "main", Role::Parent).with_passphrase("blue kettle")
    }

    #[tokio::test(start_paused = true)]
    async fn test_correct_passphrase_trimmed() {
        let gate = PassphraseGate::new();
        let limiter = Arc::new(RateLimiter::new());
        let mac = MacAddress::parse("aa:bb:cc:dd:ee:ff").unwrap();

        let pending = gate.begin(parent(), Some(mac.clone()));
        assert_eq!(pending.user_name(), "Mum");

        let verified = gate.verify(pending, "  blue kettle\n", &limiter, IP).unwrap();
        assert_eq!(verified.identity.id, "p1");
        assert_eq!(verified.hardware_address, Some(mac));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_passphrase_records_failure() {
        let gate = PassphraseGate::new();
        let limiter = Arc::new(RateLimiter::new());

        let err = gate
            .verify(gate.begin(parent(), None), "Blue Kettle", &limiter, IP)
            .unwrap_err();
        assert_eq!(err, Error::PassphraseIncorrect);
        assert_eq!(limiter.failures(IP), 1);

        let err = gate.verify(gate.begin(parent(), None), "   ", &limiter, IP).unwrap_err();
        assert_eq!(err, Error::PassphraseIncorrect);
        assert_eq!(limiter.failures(IP), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_boundary() {
        let gate = PassphraseGate::new();
        let limiter = Arc::new(RateLimiter::new());

        let pending = gate.begin(parent(), None);
        tokio::time::advance(Duration::from_secs(300)).await;
        assert!(gate.verify(pending, "blue kettle", &limiter, IP).is_ok());

        let pending = gate.begin(parent(), None);
        tokio::time::advance(Duration::from_secs(301)).await;
        let err = gate.verify(pending, "blue kettle", &limiter, IP).unwrap_err();
        assert_eq!(err, Error::PassphraseExpired);
        assert_eq!(limiter.failures(IP), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_locked_source_is_refused() {
        let gate = PassphraseGate::new();
        let limiter = Arc::new(RateLimiter::new());
        for _ in 0..3 {
            limiter.record_failure(IP);
        }

        let err = gate
            .verify(gate.begin(parent(), None), "blue kettle", &limiter, IP)
            .unwrap_err();
        assert_eq!(err, Error::RateLimited { remaining_seconds: 30 });
    }

    #[tokio::test]
    async fn test_applies_only_to_privileged_with_passphrase() {
        let gate = PassphraseGate::new();
        assert!(gate.applies_to(&parent()));
        assert!(!gate.applies_to(&Identity::new("p2", "Dad", "1111", "main", Role::Admin)));
        assert!(!gate.applies_to(
            &Identity::new("c1", "Kid", "1234", "tutor", Role::Child).with_passphrase("x")
        ));
    }
}
