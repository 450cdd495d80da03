//! # Rarity Tables
//!
//! Static weighted-probability tables per pack type, and the pity
//! renormalization that reshapes them for a given counter.
//!
//! ## Renormalization
//!
//! ```text
//! guaranteed tier?  ──yes──> weight[T] = 1.0, everything else 0
//!        │
//!        no
//!        ▼
//! boost every tier with multiplier > 1       total_boost = Σ(boosted - base)
//!        ▼
//! take total_boost from uncommon (≤ 50% of uncommon), remainder from common (floor 0)
//!        ▼
//! divide by the new total
//! ```
//!
//! The uncommon-first order and the 50% cap decide how the economy feels to
//! players. Do not "fix" them without product sign-off.

use rand::Rng;
use serde::{Deserialize, Serialize};

use daddeck_shared::constants::UNCOMMON_DONATION_CAP;

use crate::error::{EconomyError, EconomyResult};
use crate::pack::PackType;
use crate::pity::{PityCounter, PityTracker};

/// Tolerance when checking that a configured table sums to 1.0.
const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Rarity tier for cards.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Rarity {
    /// Common cards - the filler slots.
    Common = 0,
    /// Uncommon cards.
    Uncommon = 1,
    /// Rare cards - at least one per pack.
    Rare = 2,
    /// Epic cards.
    Epic = 3,
    /// Legendary cards.
    Legendary = 4,
    /// Mythic cards.
    Mythic = 5,
}

impl Rarity {
    /// Every tier, lowest first.
    pub const ALL: [Self; 6] = [
        Self::Common,
        Self::Uncommon,
        Self::Rare,
        Self::Epic,
        Self::Legendary,
        Self::Mythic,
    ];

    /// Tiers covered by bad-luck protection, lowest first.
    pub const PITY_TIERS: [Self; 4] = [Self::Rare, Self::Epic, Self::Legendary, Self::Mythic];

    /// Position of this tier in a weight array.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Converts from u8 to Rarity.
    #[inline]
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Common),
            1 => Some(Self::Uncommon),
            2 => Some(Self::Rare),
            3 => Some(Self::Epic),
            4 => Some(Self::Legendary),
            5 => Some(Self::Mythic),
            _ => None,
        }
    }

    /// Lowercase name used in config files and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Common => "common",
            Self::Uncommon => "uncommon",
            Self::Rare => "rare",
            Self::Epic => "epic",
            Self::Legendary => "legendary",
            Self::Mythic => "mythic",
        }
    }
}

/// Probability per rarity tier, indexed by [`Rarity::index`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WeightSpec", into = "WeightSpec")]
pub struct RarityWeights {
    weights: [f64; 6],
}

/// Named-field form of a weight table, as written in TOML.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
struct WeightSpec {
    common: f64,
    uncommon: f64,
    rare: f64,
    epic: f64,
    legendary: f64,
    mythic: f64,
}

impl TryFrom<WeightSpec> for RarityWeights {
    type Error = EconomyError;

    fn try_from(raw: WeightSpec) -> EconomyResult<Self> {
        Self::new([
            raw.common,
            raw.uncommon,
            raw.rare,
            raw.epic,
            raw.legendary,
            raw.mythic,
        ])
    }
}

impl From<RarityWeights> for WeightSpec {
    fn from(w: RarityWeights) -> Self {
        Self {
            common: w.weights[0],
            uncommon: w.weights[1],
            rare: w.weights[2],
            epic: w.weights[3],
            legendary: w.weights[4],
            mythic: w.weights[5],
        }
    }
}

impl RarityWeights {
    /// Creates a base table. Weights must be finite, non-negative and sum to 1.0.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::InvalidWeights`] otherwise.
    pub fn new(weights: [f64; 6]) -> EconomyResult<Self> {
        if let Some(bad) = weights.iter().find(|w| !w.is_finite() || **w < 0.0) {
            return Err(EconomyError::InvalidWeights(format!(
                "weight {bad} is negative or not finite"
            )));
        }
        let total: f64 = weights.iter().sum();
        if (total - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(EconomyError::InvalidWeights(format!(
                "weights sum to {total}, expected 1.0"
            )));
        }
        Ok(Self { weights })
    }

    /// A table that always yields `tier`.
    #[must_use]
    pub fn guaranteed(tier: Rarity) -> Self {
        let mut weights = [0.0; 6];
        weights[tier.index()] = 1.0;
        Self { weights }
    }

    /// Weight of a single tier.
    #[inline]
    #[must_use]
    pub const fn get(&self, rarity: Rarity) -> f64 {
        self.weights[rarity.index()]
    }

    /// All weights, lowest tier first.
    #[inline]
    #[must_use]
    pub const fn as_array(&self) -> &[f64; 6] {
        &self.weights
    }

    /// Sum of all weights.
    #[must_use]
    pub fn total(&self) -> f64 {
        self.weights.iter().sum()
    }

    /// Scales the table so it sums to 1.0.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        let total = self.total();
        if total > 0.0 && (total - 1.0).abs() > f64::EPSILON {
            for w in &mut self.weights {
                *w /= total;
            }
        }
        self
    }

    /// Rolls a tier from the table.
    pub fn roll<R: Rng + ?Sized>(&self, rng: &mut R) -> Rarity {
        let mut point = rng.gen::<f64>() * self.total();
        let mut last_nonzero = Rarity::Common;
        for rarity in Rarity::ALL {
            let weight = self.weights[rarity.index()];
            if weight <= 0.0 {
                continue;
            }
            last_nonzero = rarity;
            if point < weight {
                return rarity;
            }
            point -= weight;
        }
        // Floating point leftovers land on the highest tier that can drop.
        last_nonzero
    }

    /// Applies pity boosts for `counter` and renormalizes.
    #[must_use]
    pub fn apply_pity(&self, counter: &PityCounter, tracker: &PityTracker) -> Self {
        if let Some(tier) = tracker.guaranteed_tier(counter) {
            return Self::guaranteed(tier);
        }

        let mut weights = self.weights;
        let mut total_boost = 0.0;
        for tier in Rarity::PITY_TIERS {
            let multiplier = tracker.multiplier(counter, tier);
            if multiplier > 1.0 {
                let base = self.weights[tier.index()];
                let boosted = base * multiplier;
                weights[tier.index()] = boosted;
                total_boost += boosted - base;
            }
        }

        if total_boost > 0.0 {
            let uncommon = weights[Rarity::Uncommon.index()];
            let from_uncommon = total_boost.min(uncommon * UNCOMMON_DONATION_CAP);
            weights[Rarity::Uncommon.index()] = uncommon - from_uncommon;

            let remainder = total_boost - from_uncommon;
            let common = weights[Rarity::Common.index()];
            weights[Rarity::Common.index()] = (common - remainder).max(0.0);
        }

        Self { weights }.normalized()
    }
}

/// Base rarity tables, one per pack type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RarityTable {
    /// Standard pack rates.
    pub standard: RarityWeights,
    /// Premium pack rates.
    pub premium: RarityWeights,
}

impl RarityTable {
    /// Base weights for a pack type.
    #[must_use]
    pub const fn base(&self, pack_type: PackType) -> &RarityWeights {
        match pack_type {
            PackType::Standard => &self.standard,
            PackType::Premium => &self.premium,
        }
    }
}

impl Default for RarityTable {
    fn default() -> Self {
        Self {
            standard: RarityWeights {
                weights: [0.60, 0.25, 0.10, 0.04, 0.009, 0.001],
            },
            premium: RarityWeights {
                weights: [0.45, 0.30, 0.16, 0.07, 0.018, 0.002],
            },
        }
    }
}
