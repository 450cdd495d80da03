//! # Pity Tracking
//!
//! Bad-luck protection for the four premium tiers.
//!
//! Every finalized pack moves each tier's counter: back to 0 if the pack
//! contained that tier (or better), otherwise up by one. The counter then
//! shapes the next pack's odds:
//!
//! ```text
//! packs since tier:  0 ........ soft ............ hard
//! multiplier:        1.0        soft_mult ──────> 10.0   ∞ (guaranteed)
//! ```

use serde::{Deserialize, Serialize};

use daddeck_shared::constants::PITY_MULTIPLIER_CEILING;
use daddeck_shared::Timestamp;

use crate::error::{EconomyError, EconomyResult};
use crate::rarity::Rarity;

/// Soft/hard pity configuration for one tier.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ThresholdSpec", into = "ThresholdSpec")]
pub struct RarityThresholds {
    soft_pity: u32,
    hard_pity: u32,
    soft_pity_multiplier: f64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
struct ThresholdSpec {
    soft_pity: u32,
    hard_pity: u32,
    soft_pity_multiplier: f64,
}

impl TryFrom<ThresholdSpec> for RarityThresholds {
    type Error = EconomyError;

    fn try_from(raw: ThresholdSpec) -> EconomyResult<Self> {
        // The tier is unknown at this level; callers re-validate with it.
        Self::validate(Rarity::Rare, raw.soft_pity, raw.hard_pity, raw.soft_pity_multiplier)
    }
}

impl From<RarityThresholds> for ThresholdSpec {
    fn from(t: RarityThresholds) -> Self {
        Self {
            soft_pity: t.soft_pity,
            hard_pity: t.hard_pity,
            soft_pity_multiplier: t.soft_pity_multiplier,
        }
    }
}

impl RarityThresholds {
    /// Creates thresholds for `tier`.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::InvalidThresholds`] unless
    /// `soft_pity < hard_pity` and `1.0 < soft_pity_multiplier <= 10.0`.
    pub fn new(
        tier: Rarity,
        soft_pity: u32,
        hard_pity: u32,
        soft_pity_multiplier: f64,
    ) -> EconomyResult<Self> {
        Self::validate(tier, soft_pity, hard_pity, soft_pity_multiplier)
    }

    fn validate(
        tier: Rarity,
        soft_pity: u32,
        hard_pity: u32,
        soft_pity_multiplier: f64,
    ) -> EconomyResult<Self> {
        let invalid = |reason: String| EconomyError::InvalidThresholds { tier, reason };

        if soft_pity >= hard_pity {
            return Err(invalid(format!(
                "soft pity {soft_pity} must be below hard pity {hard_pity}"
            )));
        }
        if !soft_pity_multiplier.is_finite() || soft_pity_multiplier <= 1.0 {
            return Err(invalid(format!(
                "soft pity multiplier {soft_pity_multiplier} must be greater than 1.0"
            )));
        }
        if soft_pity_multiplier > PITY_MULTIPLIER_CEILING {
            return Err(invalid(format!(
                "soft pity multiplier {soft_pity_multiplier} exceeds the {PITY_MULTIPLIER_CEILING} ceiling"
            )));
        }

        Ok(Self {
            soft_pity,
            hard_pity,
            soft_pity_multiplier,
        })
    }

    /// Packs without the tier before odds start rising.
    #[inline]
    #[must_use]
    pub const fn soft_pity(&self) -> u32 {
        self.soft_pity
    }

    /// Packs without the tier before it is guaranteed.
    #[inline]
    #[must_use]
    pub const fn hard_pity(&self) -> u32 {
        self.hard_pity
    }

    /// Multiplier applied the moment soft pity is reached.
    #[inline]
    #[must_use]
    pub const fn soft_pity_multiplier(&self) -> f64 {
        self.soft_pity_multiplier
    }
}

/// Thresholds for every pity tier.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PityThresholds {
    /// Rare thresholds.
    pub rare: RarityThresholds,
    /// Epic thresholds.
    pub epic: RarityThresholds,
    /// Legendary thresholds.
    pub legendary: RarityThresholds,
    /// Mythic thresholds.
    pub mythic: RarityThresholds,
}

impl PityThresholds {
    /// Thresholds for a tier, `None` for common/uncommon.
    #[must_use]
    pub const fn for_tier(&self, tier: Rarity) -> Option<&RarityThresholds> {
        match tier {
            Rarity::Rare => Some(&self.rare),
            Rarity::Epic => Some(&self.epic),
            Rarity::Legendary => Some(&self.legendary),
            Rarity::Mythic => Some(&self.mythic),
            Rarity::Common | Rarity::Uncommon => None,
        }
    }

    /// Re-checks every tier with its own name attached to any error.
    ///
    /// # Errors
    ///
    /// Returns the first [`EconomyError::InvalidThresholds`] found.
    pub fn validate(&self) -> EconomyResult<()> {
        for tier in Rarity::PITY_TIERS {
            if let Some(t) = self.for_tier(tier) {
                RarityThresholds::new(tier, t.soft_pity, t.hard_pity, t.soft_pity_multiplier)?;
            }
        }
        Ok(())
    }
}

impl Default for PityThresholds {
    fn default() -> Self {
        Self {
            rare: RarityThresholds {
                soft_pity: 15,
                hard_pity: 30,
                soft_pity_multiplier: 2.0,
            },
            epic: RarityThresholds {
                soft_pity: 20,
                hard_pity: 40,
                soft_pity_multiplier: 2.0,
            },
            legendary: RarityThresholds {
                soft_pity: 40,
                hard_pity: 80,
                soft_pity_multiplier: 3.0,
            },
            mythic: RarityThresholds {
                soft_pity: 100,
                hard_pity: 200,
                soft_pity_multiplier: 5.0,
            },
        }
    }
}

/// Per-identity pity counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PityCounter {
    /// Packs opened since the last rare-or-better.
    pub packs_since_rare: u32,
    /// Packs opened since the last epic-or-better.
    pub packs_since_epic: u32,
    /// Packs opened since the last legendary-or-better.
    pub packs_since_legendary: u32,
    /// Packs opened since the last mythic.
    pub packs_since_mythic: u32,
    /// When the counter last moved.
    pub last_updated: Timestamp,
}

impl PityCounter {
    /// Packs since `tier`; always 0 for common/uncommon.
    #[must_use]
    pub const fn packs_since(&self, tier: Rarity) -> u32 {
        match tier {
            Rarity::Rare => self.packs_since_rare,
            Rarity::Epic => self.packs_since_epic,
            Rarity::Legendary => self.packs_since_legendary,
            Rarity::Mythic => self.packs_since_mythic,
            Rarity::Common | Rarity::Uncommon => 0,
        }
    }

    fn slot_mut(&mut self, tier: Rarity) -> Option<&mut u32> {
        match tier {
            Rarity::Rare => Some(&mut self.packs_since_rare),
            Rarity::Epic => Some(&mut self.packs_since_epic),
            Rarity::Legendary => Some(&mut self.packs_since_legendary),
            Rarity::Mythic => Some(&mut self.packs_since_mythic),
            Rarity::Common | Rarity::Uncommon => None,
        }
    }
}

/// Pure pity arithmetic over an owned threshold set.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PityTracker {
    thresholds: PityThresholds,
}

impl PityTracker {
    /// Creates a tracker.
    #[must_use]
    pub const fn new(thresholds: PityThresholds) -> Self {
        Self { thresholds }
    }

    /// Creates a tracker after validating every tier.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::InvalidThresholds`] for the first bad tier.
    pub fn try_new(thresholds: PityThresholds) -> EconomyResult<Self> {
        thresholds.validate()?;
        Ok(Self { thresholds })
    }

    /// The configured thresholds.
    #[must_use]
    pub const fn thresholds(&self) -> &PityThresholds {
        &self.thresholds
    }

    /// Advances `counter` past one finalized pack.
    ///
    /// A tier resets when anything at or above it was pulled. This is NOT
    /// idempotent: feeding the same pack twice counts it twice.
    #[must_use]
    pub fn update(
        &self,
        counter: &PityCounter,
        pulled: impl IntoIterator<Item = Rarity>,
        now: Timestamp,
    ) -> PityCounter {
        let best = pulled.into_iter().max();
        let mut next = *counter;
        for tier in Rarity::PITY_TIERS {
            if let Some(slot) = next.slot_mut(tier) {
                *slot = if best.is_some_and(|b| b >= tier) {
                    0
                } else {
                    slot.saturating_add(1)
                };
            }
        }
        next.last_updated = now;
        next
    }

    /// Odds multiplier for `tier`: 1.0 below soft pity, a linear ramp from the
    /// soft multiplier to 10.0 inside `[soft, hard)`, infinite at hard pity.
    #[must_use]
    pub fn multiplier(&self, counter: &PityCounter, tier: Rarity) -> f64 {
        let Some(t) = self.thresholds.for_tier(tier) else {
            return 1.0;
        };
        let packs = counter.packs_since(tier);

        if packs >= t.hard_pity {
            return f64::INFINITY;
        }
        if packs < t.soft_pity {
            return 1.0;
        }

        let progress = f64::from(packs - t.soft_pity) / f64::from(t.hard_pity - t.soft_pity);
        t.soft_pity_multiplier + (PITY_MULTIPLIER_CEILING - t.soft_pity_multiplier) * progress
    }

    /// Highest tier at or over hard pity. Only one tier is forced at a time.
    #[must_use]
    pub fn guaranteed_tier(&self, counter: &PityCounter) -> Option<Rarity> {
        Rarity::PITY_TIERS.into_iter().rev().find(|&tier| {
            self.thresholds
                .for_tier(tier)
                .is_some_and(|t| counter.packs_since(tier) >= t.hard_pity)
        })
    }
}
