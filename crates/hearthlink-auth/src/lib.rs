//! Hearthlink Auth - PIN, device and passphrase authentication
//!
//! Decides which configured identity a browser connection may act as.
//!
//! # Login Flow
//!
//! 1. The connection's source address reserves a try from the [`RateLimiter`]
//! 2. [`authenticate`] matches the PIN and, when known, the device's hardware address
//! 3. Parents and admins with a passphrase go through the [`PassphraseGate`]
//! 4. On success the limiter entry for the source is cleared
//!
//! # Example
//!
//! ```no_run
//! use hearthlink_auth::{FileStore, IdentityDirectory, RateLimiter};
//! use std::sync::Arc;
//!
//! async fn example() {
//!     let store = Arc::new(FileStore::with_path("users.yaml"));
//!     let directory = IdentityDirectory::load(store).unwrap();
//!     let limiter = Arc::new(RateLimiter::new());
//!
//!     if let Ok(attempt) = limiter.begin("192.168.1.20") {
//!         let outcome = directory.authenticate("1234", None).await;
//!         println!("{}", outcome.reason);
//!         match outcome.into_result() {
//!             Ok(_) => attempt.succeed(),
//!             Err(_) => attempt.fail(),
//!         }
//!     }
//! }
//! ```

pub mod directory;
pub mod engine;
pub mod identity;
pub mod passphrase;
pub mod rate_limit;
pub mod storage;

pub use directory::IdentityDirectory;
pub use engine::{authenticate, AuthOutcome, AuthReason};
pub use identity::{is_valid_pin, Identity};
pub use passphrase::{PassphraseGate, PendingSecondFactor, Verified, PASSPHRASE_TIMEOUT};
pub use rate_limit::{Attempt, RateLimitDecision, RateLimiter, LOCKOUT_DURATION, MAX_FAILED_ATTEMPTS};
pub use storage::{DirectoryStore, FileStore, MemoryStore, StorageError, StorageResult};
