//! # Economy Error Types
//!
//! All errors that can occur while building or rolling packs.

use thiserror::Error;

use crate::rarity::Rarity;

/// Errors that can occur in the economy system.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EconomyError {
    /// Pity thresholds violate `soft < hard` or the multiplier bounds.
    #[error("invalid pity thresholds for {tier:?}: {reason}")]
    InvalidThresholds {
        /// Tier the thresholds belong to.
        tier: Rarity,
        /// What was wrong with them.
        reason: String,
    },

    /// A rarity weight table is negative, non-finite or does not sum to 1.0.
    #[error("invalid rarity weights: {0}")]
    InvalidWeights(String),

    /// The card catalog has no cards for a rarity the pack needs.
    #[error("card catalog has no cards of rarity {0:?}")]
    CatalogExhausted(Rarity),

    /// Invalid configuration file.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for economy operations.
pub type EconomyResult<T> = Result<T, EconomyError>;
