//! Per-source failure counting with timed lockout
//!
//! A soft deterrent against PIN guessing, shared by the PIN and passphrase
//! steps. Entries live in memory only.

use hearthlink_core::Error;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Consecutive failures that arm a lockout
pub const MAX_FAILED_ATTEMPTS: u32 = 3;

/// How long a lockout lasts
pub const LOCKOUT_DURATION: Duration = Duration::from_secs(30);

/// Outcome of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Locked { remaining_seconds: u64 },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed)
    }

    /// Convert into the protocol error for a locked source
    pub fn into_result(self) -> Result<(), Error> {
        match self {
            RateLimitDecision::Allowed => Ok(()),
            RateLimitDecision::Locked { remaining_seconds } => {
                Err(Error::RateLimited { remaining_seconds })
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Entry {
    failures: u32,
    /// Attempts that have started but not yet been settled
    in_flight: u32,
    locked_until: Option<Instant>,
}

impl Entry {
    fn is_idle(&self) -> bool {
        self.failures == 0 && self.in_flight == 0 && self.locked_until.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settle {
    Failed,
    Succeeded,
    Released,
}

/// Failure counter keyed by source address
pub struct RateLimiter {
    max_failures: u32,
    lockout: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    /// Create a limiter with the standard policy (3 failures, 30 seconds)
    pub fn new() -> Self {
        Self::with_policy(MAX_FAILED_ATTEMPTS, LOCKOUT_DURATION)
    }

    /// Create a limiter with a custom policy
    pub fn with_policy(max_failures: u32, lockout: Duration) -> Self {
        Self {
            max_failures: max_failures.max(1),
            lockout,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `source` may attempt authentication now
    ///
    /// An expired lockout is reset here rather than by a timer.
    pub fn check(&self, source: &str) -> RateLimitDecision {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(entry) = entries.get_mut(source) else {
            return RateLimitDecision::Allowed;
        };
        let decision = self.lock_state(source, entry, now);
        if entry.is_idle() {
            entries.remove(source);
        }
        decision
    }

    /// Reserve one try for `source`
    ///
    /// The lockout check and the reservation happen under one lock, and
    /// in-flight attempts count against the remaining tries, so concurrent
    /// attempts from one source can never exceed the failure budget. Settle
    /// the returned [`Attempt`] once the outcome is known.
    pub fn begin(self: &Arc<Self>, source: &str) -> Result<Attempt, Error> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.entry(source.to_string()).or_default();

        if let RateLimitDecision::Locked { remaining_seconds } = self.lock_state(source, entry, now) {
            return Err(Error::RateLimited { remaining_seconds });
        }
        if entry.failures + entry.in_flight >= self.max_failures {
            debug!("{} has {} attempt(s) in flight", source, entry.in_flight);
            return Err(Error::RateLimited {
                remaining_seconds: ceil_seconds(self.lockout),
            });
        }

        entry.in_flight += 1;
        Ok(Attempt {
            limiter: Arc::clone(self),
            source: source.to_string(),
            settled: false,
        })
    }

    /// Count a failed attempt; ignored while `source` is locked out
    pub fn record_failure(&self, source: &str) {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.entry(source.to_string()).or_default();
        self.count_failure(source, entry, now);
    }

    /// Forget the failures and lockout of `source` (called on success)
    pub fn clear(&self, source: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(source) {
            entry.failures = 0;
            entry.locked_until = None;
            if entry.is_idle() {
                entries.remove(source);
            }
        }
    }

    /// Current consecutive failure count for `source`
    pub fn failures(&self, source: &str) -> u32 {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(source).map(|e| e.failures).unwrap_or(0)
    }

    fn settle(&self, source: &str, outcome: Settle) {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = entries.get_mut(source) else {
            return;
        };

        entry.in_flight = entry.in_flight.saturating_sub(1);
        match outcome {
            Settle::Failed => self.count_failure(source, entry, now),
            Settle::Succeeded => {
                entry.failures = 0;
                entry.locked_until = None;
            }
            Settle::Released => {}
        }
        if entry.is_idle() {
            entries.remove(source);
        }
    }

    /// Report the lockout of `entry`, resetting it if it has expired
    fn lock_state(&self, source: &str, entry: &mut Entry, now: Instant) -> RateLimitDecision {
        match entry.locked_until {
            Some(until) if until > now => RateLimitDecision::Locked {
                remaining_seconds: ceil_seconds(until - now),
            },
            Some(_) => {
                debug!("Lockout expired for {}", source);
                entry.locked_until = None;
                entry.failures = 0;
                RateLimitDecision::Allowed
            }
            None => RateLimitDecision::Allowed,
        }
    }

    fn count_failure(&self, source: &str, entry: &mut Entry, now: Instant) {
        if let Some(until) = entry.locked_until {
            if until > now {
                return;
            }
            entry.locked_until = None;
        }

        entry.failures += 1;
        if entry.failures >= self.max_failures {
            entry.failures = 0;
            entry.locked_until = Some(now + self.lockout);
            warn!(
                "Locking out {} for {}s after {} failed attempts",
                source,
                self.lockout.as_secs(),
                self.max_failures
            );
        }
    }
}

fn ceil_seconds(duration: Duration) -> u64 {
    duration.as_millis().div_ceil(1000).max(1) as u64
}

/// One authentication attempt holding a try from its source's budget
///
/// Settle it with [`fail`](Self::fail) or [`succeed`](Self::succeed).
/// Dropping it unsettled hands the try back without counting anything.
#[must_use = "an unsettled attempt is released when dropped"]
pub struct Attempt {
    limiter: Arc<RateLimiter>,
    source: String,
    settled: bool,
}

impl Attempt {
    /// Count this attempt as a failure
    pub fn fail(mut self) {
        self.settled = true;
        self.limiter.settle(&self.source, Settle::Failed);
    }

    /// Clear the source's failures
    pub fn succeed(mut self) {
        self.settled = true;
        self.limiter.settle(&self.source, Settle::Succeeded);
    }
}

impl Drop for Attempt {
    fn drop(&mut self) {
        if !self.settled {
            self.limiter.settle(&self.source, Settle::Released);
        }
    }
}

impl std::fmt::Debug for Attempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attempt").field("source", &self.source).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IP: &str = "192.168.1.20";

    #[tokio::test(start_paused = true)]
    async fn test_lockout_after_three_failures() {
        let limiter = RateLimiter::new();

        for _ in 0..3 {
            assert!(limiter.check(IP).is_allowed());
            limiter.record_failure(IP);
        }

        match limiter.check(IP) {
            RateLimitDecision::Locked { remaining_seconds } => {
                assert!(remaining_seconds > 0 && remaining_seconds <= 30);
            }
            RateLimitDecision::Allowed => panic!("fourth attempt should be locked"),
        }

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(
            limiter.check(IP),
            RateLimitDecision::Locked {
                remaining_seconds: 20
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_lockout_expires_and_resets() {
        let limiter = RateLimiter::new();
        for _ in 0..3 {
            limiter.record_failure(IP);
        }

        tokio::time::advance(LOCKOUT_DURATION + Duration::from_millis(1)).await;
        assert!(limiter.check(IP).is_allowed());
        assert_eq!(limiter.failures(IP), 0);

        // One more failure must not re-arm the lockout
        limiter.record_failure(IP);
        assert!(limiter.check(IP).is_allowed());
        assert_eq!(limiter.failures(IP), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_ignored_while_locked() {
        let limiter = RateLimiter::new();
        for _ in 0..5 {
            limiter.record_failure(IP);
        }
        assert_eq!(limiter.failures(IP), 0);
        assert!(!limiter.check(IP).is_allowed());
    }

    #[tokio::test]
    async fn test_clear_and_isolation() {
        let limiter = RateLimiter::new();
        limiter.record_failure(IP);
        limiter.record_failure(IP);
        limiter.record_failure("10.0.0.9");

        limiter.clear(IP);
        assert_eq!(limiter.failures(IP), 0);
        assert_eq!(limiter.failures("10.0.0.9"), 1);
    }

    #[test]
    fn test_into_result() {
        let err = RateLimitDecision::Locked {
            remaining_seconds: 7,
        }
        .into_result()
        .unwrap_err();
        assert_eq!(err.code(), "rate_limited");
        assert!(RateLimitDecision::Allowed.into_result().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_attempts_share_the_budget() {
        let limiter = Arc::new(RateLimiter::new());

        let held: Vec<Attempt> = (0..3).map(|_| limiter.begin(IP).unwrap()).collect();
        assert_eq!(
            limiter.begin(IP).unwrap_err(),
            Error::RateLimited {
                remaining_seconds: 30
            }
        );

        // Other sources are unaffected
        let other = limiter.begin("10.0.0.9").unwrap();
        drop(other);

        for attempt in held {
            attempt.fail();
        }
        assert!(!limiter.check(IP).is_allowed());
        assert!(limiter.begin(IP).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_attempt_returns_its_try() {
        let limiter = Arc::new(RateLimiter::new());
        limiter.record_failure(IP);
        limiter.record_failure(IP);

        let attempt = limiter.begin(IP).unwrap();
        assert!(limiter.begin(IP).is_err());
        drop(attempt);
        assert_eq!(limiter.failures(IP), 2);

        limiter.begin(IP).unwrap().succeed();
        assert_eq!(limiter.failures(IP), 0);
        assert!(limiter.check(IP).is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_begin_after_lockout_expires() {
        let limiter = Arc::new(RateLimiter::new());
        for _ in 0..3 {
            limiter.begin(IP).unwrap().fail();
        }
        assert!(limiter.begin(IP).is_err());

        tokio::time::advance(LOCKOUT_DURATION).await;
        let attempt = limiter.begin(IP).unwrap();
        attempt.fail();
        assert_eq!(limiter.failures(IP), 1);
    }
}
