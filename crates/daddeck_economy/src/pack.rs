//! # Pack Assembly
//!
//! Turns a rarity table, a pity counter and a stream of randomness into six
//! cards.
//!
//! ## Slot Policy
//!
//! ```text
//! slot:    1        2        3        4          5          6
//!          common   common   common   adjusted   adjusted   adjusted, floor = rare
//! ```
//!
//! "adjusted" is the pack type's base table after pity boosts. Every card
//! then gets an independent 1-in-6 holo roll.
//!
//! ## Replayability
//!
//! Per slot the stream is consumed in a fixed order: rarity, card index,
//! holo flag, holo variant (only when holo). [`PackAssembler::assemble_pack`]
//! seeds ChaCha20 with the pack's `combined_hash`, so anyone holding the
//! committed entropy and the pre-open pity counter can re-derive the cards.

use std::fmt;
use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use daddeck_shared::constants::{CARDS_PER_PACK, COMMON_SLOTS, GUARANTEED_RARE_SLOT};
use daddeck_shared::{Timestamp, HOLO_ODDS_DENOMINATOR};

use crate::catalog::{CardCatalog, CardId};
use crate::error::{EconomyError, EconomyResult};
use crate::pity::{PityCounter, PityTracker};
use crate::rarity::{Rarity, RarityTable, RarityWeights};

/// Pack product line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackType {
    /// Regular booster.
    #[default]
    Standard,
    /// Booster with richer base rates.
    Premium,
}

impl PackType {
    /// All pack types.
    pub const ALL: [Self; 2] = [Self::Standard, Self::Premium];

    /// Lowercase name used in config and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Premium => "premium",
        }
    }
}

impl fmt::Display for PackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Holo finish of a card. `None` unless the card rolled holo.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoloType {
    /// Not holographic.
    #[default]
    None,
    /// Standard foil.
    Standard,
    /// Reverse foil.
    Reverse,
    /// Full-art foil.
    FullArt,
    /// Prismatic foil.
    Prismatic,
}

impl HoloType {
    /// Variant weights out of 100, used once a card is known to be holo.
    const VARIANT_WEIGHTS: [(Self, u32); 4] = [
        (Self::Standard, 60),
        (Self::Reverse, 25),
        (Self::FullArt, 10),
        (Self::Prismatic, 5),
    ];

    /// Picks a holo variant. Never returns `None`.
    pub fn roll<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let total: u32 = Self::VARIANT_WEIGHTS.iter().map(|(_, w)| w).sum();
        let mut point = rng.gen_range(0..total);
        for (variant, weight) in Self::VARIANT_WEIGHTS {
            if point < weight {
                return variant;
            }
            point -= weight;
        }
        Self::Standard
    }
}

/// One card in a pack.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardInstance {
    /// Catalog identifier.
    pub card_id: CardId,
    /// Rolled rarity.
    pub rarity: Rarity,
    /// Whether the card rolled holo.
    pub is_holo: bool,
    /// Holo variant; `HoloType::None` when `is_holo` is false.
    pub holo_type: HoloType,
}

/// Committed randomness for one pack.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackEntropy {
    /// Seed supplied by (or on behalf of) the client.
    pub client_seed: [u8; 32],
    /// Per-open server nonce. Drawn fresh for every open, so the server seed
    /// cannot be known before the open even for a reused pack id.
    pub server_nonce: [u8; 16],
    /// Seed derived by the server from its secret, the pack id and the nonce.
    pub server_seed: [u8; 32],
    /// `SHA-256(client_seed || server_seed || pack_id)`.
    pub combined_hash: [u8; 32],
}

impl PackEntropy {
    /// Lowercase hex of the combined hash.
    #[must_use]
    pub fn combined_hash_hex(&self) -> String {
        hex::encode(self.combined_hash)
    }
}

impl fmt::Debug for PackEntropy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Seeds are not secret once committed, but they are noisy in logs.
        f.debug_struct("PackEntropy")
            .field("combined_hash", &self.combined_hash_hex())
            .finish_non_exhaustive()
    }
}

/// Everything about a pack that is fixed before its cards are rolled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PackHeader {
    /// Pack identifier (also the idempotency key).
    pub id: Uuid,
    /// Product line.
    pub pack_type: PackType,
    /// Open time.
    pub opened_at: Timestamp,
    /// Committed entropy.
    pub entropy: PackEntropy,
}

/// An opened pack.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pack {
    /// Pack identifier.
    pub id: Uuid,
    /// Product line.
    pub pack_type: PackType,
    /// The six cards, in slot order.
    pub cards: Vec<CardInstance>,
    /// Highest rarity among `cards`.
    pub best_rarity: Rarity,
    /// Open time.
    pub opened_at: Timestamp,
    /// Entropy the cards were derived from.
    pub entropy: PackEntropy,
}

impl Pack {
    /// Header fields of this pack.
    #[must_use]
    pub const fn header(&self) -> PackHeader {
        PackHeader {
            id: self.id,
            pack_type: self.pack_type,
            opened_at: self.opened_at,
            entropy: self.entropy,
        }
    }

    /// Rarities in slot order.
    pub fn rarities(&self) -> impl Iterator<Item = Rarity> + '_ {
        self.cards.iter().map(|c| c.rarity)
    }

    /// Number of holo cards.
    #[must_use]
    pub fn holo_count(&self) -> usize {
        self.cards.iter().filter(|c| c.is_holo).count()
    }
}

/// Result of rolling one pack's cards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssembledCards {
    /// Cards in slot order.
    pub cards: Vec<CardInstance>,
    /// Highest rarity among `cards`.
    pub best_rarity: Rarity,
    /// Tier forced by hard pity, if any.
    pub forced_tier: Option<Rarity>,
}

/// A way a pack can break the slot policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StructureFault {
    /// Not exactly six cards.
    WrongCardCount {
        /// Cards found.
        actual: usize,
    },
    /// Slots 1-3 must be common.
    NonCommonInCommonSlot {
        /// Zero-based slot.
        slot: usize,
        /// Rarity found.
        rarity: Rarity,
    },
    /// Slot 6 must be rare or better.
    GuaranteedSlotBelowRare {
        /// Rarity found.
        rarity: Rarity,
    },
    /// `best_rarity` disagrees with the cards.
    BestRarityMismatch {
        /// Value on the pack.
        claimed: Rarity,
        /// Value computed from the cards.
        actual: Rarity,
    },
    /// Card not in the catalog at the claimed rarity.
    UnknownCard {
        /// Zero-based slot.
        slot: usize,
        /// Offending id.
        card_id: CardId,
    },
    /// `is_holo` and `holo_type` disagree.
    HoloMismatch {
        /// Zero-based slot.
        slot: usize,
    },
}

impl fmt::Display for StructureFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongCardCount { actual } => {
                write!(f, "pack has {actual} cards, expected {CARDS_PER_PACK}")
            }
            Self::NonCommonInCommonSlot { slot, rarity } => {
                write!(f, "slot {} holds {rarity:?}, expected common", slot + 1)
            }
            Self::GuaranteedSlotBelowRare { rarity } => {
                write!(f, "guaranteed slot holds {rarity:?}, expected rare or better")
            }
            Self::BestRarityMismatch { claimed, actual } => {
                write!(f, "best rarity claims {claimed:?} but cards give {actual:?}")
            }
            Self::UnknownCard { slot, card_id } => {
                write!(f, "slot {} card '{card_id}' is not in the catalog", slot + 1)
            }
            Self::HoloMismatch { slot } => {
                write!(f, "slot {} holo flag disagrees with holo type", slot + 1)
            }
        }
    }
}

/// Aggregate results of a simulation run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PackStatistics {
    /// Packs simulated.
    pub packs: u64,
    /// Cards rolled per rarity.
    pub rarity_counts: [u64; 6],
    /// Packs whose best card was each rarity.
    pub best_rarity_counts: [u64; 6],
    /// Holo cards rolled.
    pub holo_cards: u64,
    /// Packs where hard pity forced a tier.
    pub forced_packs: u64,
}

impl PackStatistics {
    /// Total cards rolled.
    #[must_use]
    pub fn cards(&self) -> u64 {
        self.rarity_counts.iter().sum()
    }

    /// Share of all cards that were `rarity`.
    #[must_use]
    pub fn card_share(&self, rarity: Rarity) -> f64 {
        let cards = self.cards();
        if cards == 0 {
            return 0.0;
        }
        self.rarity_counts[rarity.index()] as f64 / cards as f64
    }

    /// Share of packs containing `rarity` or better.
    #[must_use]
    pub fn packs_with_at_least(&self, rarity: Rarity) -> f64 {
        if self.packs == 0 {
            return 0.0;
        }
        let hits: u64 = self.best_rarity_counts[rarity.index()..].iter().sum();
        hits as f64 / self.packs as f64
    }

    /// Share of cards that rolled holo.
    #[must_use]
    pub fn holo_rate(&self) -> f64 {
        let cards = self.cards();
        if cards == 0 {
            return 0.0;
        }
        self.holo_cards as f64 / cards as f64
    }
}

/// Builds packs from rates, pity and a card catalog.
#[derive(Clone)]
pub struct PackAssembler {
    table: RarityTable,
    tracker: PityTracker,
    catalog: Arc<dyn CardCatalog>,
}

impl fmt::Debug for PackAssembler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackAssembler")
            .field("table", &self.table)
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}

impl PackAssembler {
    /// Creates an assembler.
    #[must_use]
    pub fn new(table: RarityTable, tracker: PityTracker, catalog: Arc<dyn CardCatalog>) -> Self {
        Self {
            table,
            tracker,
            catalog,
        }
    }

    /// Base rates.
    #[must_use]
    pub const fn table(&self) -> &RarityTable {
        &self.table
    }

    /// Pity arithmetic.
    #[must_use]
    pub const fn tracker(&self) -> &PityTracker {
        &self.tracker
    }

    /// Card source.
    #[must_use]
    pub fn catalog(&self) -> &dyn CardCatalog {
        self.catalog.as_ref()
    }

    /// Fails on the first rarity the catalog cannot supply.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::CatalogExhausted`].
    pub fn check_catalog(&self) -> EconomyResult<()> {
        match self.catalog.missing_rarities().first() {
            Some(&rarity) => Err(EconomyError::CatalogExhausted(rarity)),
            None => Ok(()),
        }
    }

    /// Pity-adjusted weights used by slots 4-6.
    #[must_use]
    pub fn adjusted_weights(&self, pack_type: PackType, counter: &PityCounter) -> RarityWeights {
        self.table.base(pack_type).apply_pity(counter, &self.tracker)
    }

    /// Rolls six cards for an identity with the given pre-open counter.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::CatalogExhausted`] if a rolled rarity has no
    /// cards. The roll is abandoned; nothing is partially returned.
    pub fn assemble<R: Rng + ?Sized>(
        &self,
        pack_type: PackType,
        counter: &PityCounter,
        rng: &mut R,
    ) -> EconomyResult<AssembledCards> {
        let adjusted = self.adjusted_weights(pack_type, counter);
        let mut cards = Vec::with_capacity(CARDS_PER_PACK);

        for slot in 0..CARDS_PER_PACK {
            let rarity = if slot < COMMON_SLOTS {
                Rarity::Common
            } else if slot == GUARANTEED_RARE_SLOT {
                adjusted.roll(rng).max(Rarity::Rare)
            } else {
                adjusted.roll(rng)
            };
            cards.push(self.draw_card(rarity, rng)?);
        }

        let best_rarity = cards
            .iter()
            .map(|c| c.rarity)
            .max()
            .unwrap_or(Rarity::Common);

        Ok(AssembledCards {
            cards,
            best_rarity,
            forced_tier: self.tracker.guaranteed_tier(counter),
        })
    }

    /// Derives a pack from its header. Deterministic in `(header, counter)`.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::CatalogExhausted`].
    pub fn assemble_pack(&self, header: &PackHeader, counter: &PityCounter) -> EconomyResult<Pack> {
        let mut rng = ChaCha20Rng::from_seed(header.entropy.combined_hash);
        let rolled = self.assemble(header.pack_type, counter, &mut rng)?;

        Ok(Pack {
            id: header.id,
            pack_type: header.pack_type,
            cards: rolled.cards,
            best_rarity: rolled.best_rarity,
            opened_at: header.opened_at,
            entropy: header.entropy,
        })
    }

    /// Slot-policy and catalog checks that need no entropy. Empty means clean.
    #[must_use]
    pub fn check_structure(&self, pack: &Pack) -> Vec<StructureFault> {
        let mut faults = Vec::new();

        if pack.cards.len() != CARDS_PER_PACK {
            faults.push(StructureFault::WrongCardCount {
                actual: pack.cards.len(),
            });
        }

        for (slot, card) in pack.cards.iter().enumerate() {
            if slot < COMMON_SLOTS && card.rarity != Rarity::Common {
                faults.push(StructureFault::NonCommonInCommonSlot {
                    slot,
                    rarity: card.rarity,
                });
            }
            if slot == GUARANTEED_RARE_SLOT && card.rarity < Rarity::Rare {
                faults.push(StructureFault::GuaranteedSlotBelowRare {
                    rarity: card.rarity,
                });
            }
            if !self.catalog.contains(&card.card_id, card.rarity) {
                faults.push(StructureFault::UnknownCard {
                    slot,
                    card_id: card.card_id.clone(),
                });
            }
            if card.is_holo == (card.holo_type == HoloType::None) {
                faults.push(StructureFault::HoloMismatch { slot });
            }
        }

        if let Some(actual) = pack.rarities().max() {
            if actual != pack.best_rarity {
                faults.push(StructureFault::BestRarityMismatch {
                    claimed: pack.best_rarity,
                    actual,
                });
            }
        }

        faults
    }

    /// Opens `packs` packs for one simulated identity, advancing pity
    /// between packs, and tallies the results.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::CatalogExhausted`].
    pub fn run_statistics<R: Rng + ?Sized>(
        &self,
        pack_type: PackType,
        start: &PityCounter,
        packs: u64,
        rng: &mut R,
    ) -> EconomyResult<PackStatistics> {
        let mut stats = PackStatistics::default();
        let mut counter = *start;

        for _ in 0..packs {
            let rolled = self.assemble(pack_type, &counter, rng)?;
            stats.packs += 1;
            stats.best_rarity_counts[rolled.best_rarity.index()] += 1;
            if rolled.forced_tier.is_some() {
                stats.forced_packs += 1;
            }
            for card in &rolled.cards {
                stats.rarity_counts[card.rarity.index()] += 1;
                if card.is_holo {
                    stats.holo_cards += 1;
                }
            }
            counter = self.tracker.update(
                &counter,
                rolled.cards.iter().map(|c| c.rarity),
                counter.last_updated,
            );
        }

        Ok(stats)
    }

    fn draw_card<R: Rng + ?Sized>(&self, rarity: Rarity, rng: &mut R) -> EconomyResult<CardInstance> {
        let pool = self.catalog.cards_of_rarity(rarity);
        if pool.is_empty() {
            return Err(EconomyError::CatalogExhausted(rarity));
        }
        let card_id = pool[rng.gen_range(0..pool.len())].clone();

        let is_holo = rng.gen_ratio(1, HOLO_ODDS_DENOMINATOR);
        let holo_type = if is_holo {
            HoloType::roll(rng)
        } else {
            HoloType::None
        };

        Ok(CardInstance {
            card_id,
            rarity,
            is_holo,
            holo_type,
        })
    }
}
