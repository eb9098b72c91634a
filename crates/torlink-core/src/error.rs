//! Error types for the torlink engine.
//!
//! Display strings stay generic so that addresses and key material never
//! end up in logs or UI surfaces. Details are carried in the variant payload
//! for callers that need them.

use thiserror::Error;

/// Core error type for handshake, delivery and storage operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Decryption or MAC failure under the shared PIN.
    #[error("invalid PIN")]
    InvalidPin,

    /// A handshake payload carried a signature that does not verify.
    /// Treated as a suspected man-in-the-middle.
    #[error("signature verification failed")]
    SignatureInvalid,

    /// The transport could not reach the peer.
    #[error("peer unreachable")]
    Unreachable(String),

    /// A bounded wait elapsed.
    #[error("operation timed out")]
    Timeout,

    /// A request sat in SENDING past the staleness window.
    #[error("friend request is stale")]
    StaleRequest(i64),

    /// Lost the race for a ping inbox entry.
    #[error("entry already claimed")]
    ClaimConflict(i64),

    /// No message key exists for this counter (duplicate or expired).
    #[error("message could not be decrypted")]
    UndecryptableMessage {
        /// Counter carried by the rejected envelope.
        counter: u64,
    },

    /// Persisted state failed an invariant check on load.
    #[error("stored state is corrupt")]
    StorageCorrupt(String),

    /// Stored payload predates the current wire format.
    #[error("unsupported payload format")]
    UnsupportedFormat,

    /// Cryptographic operation failed.
    /// Details are intentionally vague to prevent oracle attacks.
    #[error("cryptographic operation failed")]
    Crypto(String),

    /// Key validation or derivation failed.
    #[error("invalid key material")]
    InvalidKey(String),

    /// Identity or address error.
    #[error("identity error")]
    Identity(String),

    /// Wire protocol error.
    #[error("protocol error")]
    Protocol(String),

    /// Encoding/decoding error.
    #[error("encoding error")]
    Encoding(String),

    /// Storage operation failed.
    #[error("storage error")]
    Storage(String),

    /// Invalid configuration value.
    #[error("invalid configuration")]
    Config(String),

    /// Resource not found.
    #[error("not found")]
    NotFound(String),
}

/// Result type alias using the engine's Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Errors the engine absorbs without surfacing to the user.
    ///
    /// A claim conflict means another task owns the entry; an unreachable
    /// peer is retried by the worker up to its bound.
    pub fn is_locally_recovered(&self) -> bool {
        matches!(self, Error::ClaimConflict(_) | Error::Unreachable(_))
    }

    /// Transport-level failures that the retry worker should try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Unreachable(_) | Error::Timeout)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Encoding(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Encoding(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::ClaimConflict(1).is_locally_recovered());
        assert!(Error::Unreachable("x".into()).is_locally_recovered());
        assert!(!Error::InvalidPin.is_locally_recovered());

        assert!(Error::Timeout.is_retryable());
        assert!(!Error::SignatureInvalid.is_retryable());
    }

    #[test]
    fn test_display_is_generic() {
        let err = Error::Unreachable("abcd.onion refused".into());
        assert_eq!(err.to_string(), "peer unreachable");
    }
}
