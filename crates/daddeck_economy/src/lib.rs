//! # DadDeck Economy
//!
//! Pure Rust pack math for the DadDeck card game.
//!
//! ## Design Principles
//!
//! 1. **Injectable randomness** - every roll takes an `Rng`; nothing calls a global RNG
//! 2. **Replayable packs** - a pack's cards are derived from a ChaCha20 stream
//!    seeded by its committed entropy, so the server can re-derive and compare
//! 3. **Pity is arithmetic, not state** - `PityTracker` is pure over an owned counter
//! 4. **External configuration** - rates, thresholds and the catalog live in TOML
//!
//! ## Thread Safety
//!
//! Everything here is `Send + Sync` and lock-free. Serializing access to a
//! given identity's counter is the caller's job (see the `daddeck` service).
//!
//! ## Example
//!
//! ```rust,ignore
//! use daddeck_economy::{EconomyConfig, PackType, PityCounter};
//!
//! let config = EconomyConfig::from_file("data/packs.toml")?;
//! let assembler = config.build_assembler()?;
//!
//! let mut rng = rand::thread_rng();
//! let roll = assembler.assemble(PackType::Standard, &PityCounter::default(), &mut rng)?;
//! println!("best card: {:?}", roll.best_rarity);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::perf)]

pub mod catalog;
pub mod config;
pub mod error;
pub mod pack;
pub mod pity;
pub mod rarity;

pub use catalog::{CardCatalog, CardId, StaticCatalog};
pub use config::{CatalogConfig, EconomyConfig};
pub use error::{EconomyError, EconomyResult};
pub use pack::{
    AssembledCards, CardInstance, HoloType, Pack, PackAssembler, PackEntropy, PackHeader,
    PackStatistics, PackType, StructureFault,
};
pub use pity::{PityCounter, PityThresholds, PityTracker, RarityThresholds};
pub use rarity::{Rarity, RarityTable, RarityWeights};
