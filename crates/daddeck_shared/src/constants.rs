//! # Engine Constants
//!
//! Values baked into the pack format. Changing any of these changes what
//! players receive, so they are not part of the TOML balance data.

// =============================================================================
// PACK LAYOUT
// =============================================================================

/// Number of card slots in every pack.
pub const CARDS_PER_PACK: usize = 6;

/// Leading slots that always yield a common card.
pub const COMMON_SLOTS: usize = 3;

/// Index of the slot that is re-mapped up to at least rare.
pub const GUARANTEED_RARE_SLOT: usize = CARDS_PER_PACK - 1;

/// Holo odds are `1 / HOLO_ODDS_DENOMINATOR` per card.
pub const HOLO_ODDS_DENOMINATOR: u32 = 6;

// =============================================================================
// PITY
// =============================================================================

/// Multiplier reached just before hard pity.
pub const PITY_MULTIPLIER_CEILING: f64 = 10.0;

/// Share of the uncommon weight that may be handed to boosted tiers.
pub const UNCOMMON_DONATION_CAP: f64 = 0.5;

// =============================================================================
// OPENING
// =============================================================================

/// Largest batch accepted by a single batch open.
pub const MAX_BATCH_PACKS: usize = 10;

// =============================================================================
// TIME
// =============================================================================

/// Milliseconds per second.
pub const MILLIS_PER_SECOND: u64 = 1_000;

/// Milliseconds per day (audit volume buckets).
pub const MILLIS_PER_DAY: u64 = 86_400_000;
