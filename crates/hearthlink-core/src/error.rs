//! Error types for Hearthlink
//!
//! The `Display` text of each variant is what gets shown to the user, so it is
//! written as a sentence. `code()` gives the stable machine-readable name.

use thiserror::Error;

/// Main error type for Hearthlink protocol operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid PIN.")]
    InvalidPin,

    #[error("This device is not authorized for that PIN.")]
    HardwareMismatch,

    #[error("Incorrect passphrase.")]
    PassphraseIncorrect,

    #[error("Session expired. Please start over.")]
    PassphraseExpired,

    #[error("No pending authentication. Please start over.")]
    NoPendingAuthentication,

    #[error("Too many attempts. Try again in {remaining_seconds}s.")]
    RateLimited { remaining_seconds: u64 },

    #[error("Not authenticated. Please log in.")]
    NotAuthenticated,

    #[error("{0}")]
    AccessDenied(String),

    #[error("{0} not found.")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error("Failed to save changes.")]
    PersistFailure(String),

    #[error("Internal error: {0} unavailable")]
    InternalUnavailable(String),

    #[error("Invalid message")]
    InvalidFrame,
}

/// Result type alias using Hearthlink's Error
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an access denied error with the default message
    pub fn access_denied() -> Self {
        Error::AccessDenied("Access denied.".to_string())
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    /// Stable snake_case name of the error class
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidPin => "invalid_pin",
            Error::HardwareMismatch => "hardware_mismatch",
            Error::PassphraseIncorrect => "passphrase_incorrect",
            Error::PassphraseExpired | Error::NoPendingAuthentication => "passphrase_expired",
            Error::RateLimited { .. } => "rate_limited",
            Error::NotAuthenticated | Error::AccessDenied(_) => "access_denied",
            Error::NotFound(_) => "not_found",
            Error::Validation(_) | Error::InvalidFrame => "validation_error",
            Error::PersistFailure(_) => "persist_failure",
            Error::InternalUnavailable(_) => "internal_unavailable",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_facing_messages() {
        assert_eq!(
            Error::RateLimited { remaining_seconds: 12 }.to_string(),
            "Too many attempts. Try again in 12s."
        );
        assert_eq!(Error::NotFound("User".into()).to_string(), "User not found.");
        assert_ne!(Error::InvalidPin.to_string(), Error::HardwareMismatch.to_string());
    }

    #[test]
    fn test_persist_failure_hides_detail() {
        let err = Error::PersistFailure("disk full".into());
        assert_eq!(err.to_string(), "Failed to save changes.");
        assert_eq!(err.code(), "persist_failure");
    }
}
