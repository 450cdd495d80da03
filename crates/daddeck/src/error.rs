//! # Service Error Types
//!
//! Everything `open_pack`, `open_batch` and `submit_pack` can refuse with.

use thiserror::Error;
use uuid::Uuid;

use daddeck_economy::{EconomyError, Rarity};
use daddeck_security::{ActionClass, RateLimitStatus, SecurityError, ViolationKind};

/// Errors returned by the pack service.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PackError {
    /// Too many opens in the window. Nothing was mutated.
    #[error("rate limited on {class} ({} allowed per window)", .status.limit)]
    RateLimited {
        /// Class that was exhausted.
        class: ActionClass,
        /// Window snapshot; use [`RateLimitStatus::retry_after`].
        status: RateLimitStatus,
    },

    /// The identity is banned. Nothing was mutated.
    #[error("identity is banned: {reason}")]
    Banned {
        /// Ban reason.
        reason: String,
    },

    /// Committed entropy does not check out. The pack was discarded.
    #[error("entropy mismatch: {0}")]
    EntropyMismatch(String),

    /// Cards do not match the committed entropy. The pack was discarded.
    #[error("pack manipulation: {0}")]
    PackManipulation(String),

    /// The pack id was already seen for this identity.
    #[error("duplicate pack {pack_id}")]
    DuplicateDetected {
        /// The repeated pack id.
        pack_id: Uuid,
    },

    /// The catalog has no card for a rarity a slot rolled. Fatal.
    #[error("card catalog has no cards of rarity {0:?}")]
    CatalogExhausted(Rarity),

    /// Collection store or state journal refused the write.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Batch size outside `1..=MAX_BATCH_PACKS`.
    #[error("invalid batch size {count}")]
    InvalidBatchSize {
        /// Requested pack count.
        count: usize,
    },

    /// Bad configuration at startup.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PackError {
    /// Maps a validation verdict to the error the caller sees.
    #[must_use]
    pub fn from_violation(kind: ViolationKind, pack_id: Uuid, details: String) -> Self {
        match kind {
            ViolationKind::EntropyMismatch => Self::EntropyMismatch(details),
            ViolationKind::PackManipulation => Self::PackManipulation(details),
            ViolationKind::DuplicateDetection => Self::DuplicateDetected { pack_id },
        }
    }

    /// True for refusals that happen before any pack is built.
    #[must_use]
    pub const fn is_blocked(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Banned { .. })
    }
}

impl From<EconomyError> for PackError {
    fn from(e: EconomyError) -> Self {
        match e {
            EconomyError::CatalogExhausted(rarity) => Self::CatalogExhausted(rarity),
            other => Self::Config(other.to_string()),
        }
    }
}

impl From<SecurityError> for PackError {
    fn from(e: SecurityError) -> Self {
        match e {
            SecurityError::Io(io) => Self::StorageUnavailable(io.to_string()),
            other => Self::Config(other.to_string()),
        }
    }
}

impl From<std::io::Error> for PackError {
    fn from(e: std::io::Error) -> Self {
        Self::StorageUnavailable(e.to_string())
    }
}

/// Result type for service operations.
pub type PackResult<T> = Result<T, PackError>;
