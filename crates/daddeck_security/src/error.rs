//! # Security Error Types

use thiserror::Error;
use uuid::Uuid;

use daddeck_shared::Fingerprint;

/// Errors raised by the security layer.
#[derive(Error, Debug)]
pub enum SecurityError {
    /// Committed entropy does not check out.
    #[error("entropy mismatch: {0}")]
    EntropyMismatch(String),

    /// Pack contents could not have come from the committed entropy.
    #[error("pack manipulation: {0}")]
    PackManipulation(String),

    /// The same pack id was seen twice from one identity.
    #[error("duplicate pack {pack_id} from {fingerprint}")]
    DuplicateDetected {
        /// Repeated pack id.
        pack_id: Uuid,
        /// Identity that sent it.
        fingerprint: Fingerprint,
    },

    /// The fingerprint provider could not produce an identity.
    #[error("fingerprint unavailable: {0}")]
    FingerprintUnavailable(String),

    /// Server secret is malformed.
    #[error("invalid server secret: {0}")]
    InvalidSecret(String),

    /// Audit journal IO failed.
    #[error("audit journal error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for security operations.
pub type SecurityResult<T> = Result<T, SecurityError>;
