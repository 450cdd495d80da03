//! # Card Catalog
//!
//! Where card identifiers come from. The assembler only needs to know which
//! cards exist at a given rarity, so the catalog is a small trait that a
//! database-backed implementation can satisfy later.

use serde::{Deserialize, Serialize};

use crate::rarity::Rarity;

/// Opaque card identifier, e.g. `"grill-master-dad"`.
pub type CardId = String;

/// Read-only view of the available cards.
pub trait CardCatalog: Send + Sync {
    /// All cards of the given rarity. Empty means the rarity cannot be filled.
    fn cards_of_rarity(&self, rarity: Rarity) -> &[CardId];

    /// True if `card_id` exists at exactly `rarity`.
    fn contains(&self, card_id: &str, rarity: Rarity) -> bool {
        self.cards_of_rarity(rarity).iter().any(|c| c == card_id)
    }

    /// Rarities with no cards at all.
    fn missing_rarities(&self) -> Vec<Rarity> {
        Rarity::ALL
            .into_iter()
            .filter(|&r| self.cards_of_rarity(r).is_empty())
            .collect()
    }
}

/// In-memory catalog, one list per rarity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticCatalog {
    #[serde(default)]
    common: Vec<CardId>,
    #[serde(default)]
    uncommon: Vec<CardId>,
    #[serde(default)]
    rare: Vec<CardId>,
    #[serde(default)]
    epic: Vec<CardId>,
    #[serde(default)]
    legendary: Vec<CardId>,
    #[serde(default)]
    mythic: Vec<CardId>,
}

impl StaticCatalog {
    /// An empty catalog.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            common: Vec::new(),
            uncommon: Vec::new(),
            rare: Vec::new(),
            epic: Vec::new(),
            legendary: Vec::new(),
            mythic: Vec::new(),
        }
    }

    /// Adds a card (builder style).
    #[must_use]
    pub fn with_card(mut self, rarity: Rarity, card_id: impl Into<CardId>) -> Self {
        self.insert(rarity, card_id);
        self
    }

    /// Adds a card. Duplicates within a rarity are ignored.
    pub fn insert(&mut self, rarity: Rarity, card_id: impl Into<CardId>) {
        let card_id = card_id.into();
        let list = self.list_mut(rarity);
        if !list.contains(&card_id) {
            list.push(card_id);
        }
    }

    /// Total number of cards across all rarities.
    #[must_use]
    pub fn len(&self) -> usize {
        Rarity::ALL
            .into_iter()
            .map(|r| self.cards_of_rarity(r).len())
            .sum()
    }

    /// True if no rarity has any card.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn list_mut(&mut self, rarity: Rarity) -> &mut Vec<CardId> {
        match rarity {
            Rarity::Common => &mut self.common,
            Rarity::Uncommon => &mut self.uncommon,
            Rarity::Rare => &mut self.rare,
            Rarity::Epic => &mut self.epic,
            Rarity::Legendary => &mut self.legendary,
            Rarity::Mythic => &mut self.mythic,
        }
    }
}

impl CardCatalog for StaticCatalog {
    fn cards_of_rarity(&self, rarity: Rarity) -> &[CardId] {
        match rarity {
            Rarity::Common => &self.common,
            Rarity::Uncommon => &self.uncommon,
            Rarity::Rare => &self.rare,
            Rarity::Epic => &self.epic,
            Rarity::Legendary => &self.legendary,
            Rarity::Mythic => &self.mythic,
        }
    }
}

impl Default for StaticCatalog {
    /// The launch set.
    fn default() -> Self {
        const SET: &[(Rarity, &[&str])] = &[
            (
                Rarity::Common,
                &[
                    "lawn-mower-dad",
                    "thermostat-guardian",
                    "socks-and-sandals",
                    "dad-joke-rookie",
                    "cargo-shorts",
                    "minivan-captain",
                ],
            ),
            (
                Rarity::Uncommon,
                &[
                    "weekend-warrior",
                    "coupon-clipper",
                    "fantasy-league-commish",
                    "garage-tinkerer",
                ],
            ),
            (
                Rarity::Rare,
                &["grill-master", "road-trip-navigator", "tool-belt-titan"],
            ),
            (Rarity::Epic, &["barbecue-sensei", "pun-lord"]),
            (Rarity::Legendary, &["the-fixer", "eternal-coach"]),
            (Rarity::Mythic, &["ultimate-dad"]),
        ];

        SET.iter()
            .flat_map(|(rarity, cards)| cards.iter().map(move |c| (*rarity, *c)))
            .fold(Self::empty(), |catalog, (rarity, card)| {
                catalog.with_card(rarity, card)
            })
    }
}
