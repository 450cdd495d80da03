//! # DadDeck
//!
//! **The pack counter.** Every DadDeck pack is opened here.
//!
//! ## Architecture
//!
//! ```text
//!                         ┌───────────────────────────┐
//!   open_pack ──────────► │        PackService        │ ◄────────── submit_pack
//!   open_batch            │   (per-identity locks)    │
//!                         └─────────────┬─────────────┘
//!          ┌──────────────┬─────────────┼──────────────┬───────────────┐
//!          ▼              ▼             ▼              ▼               ▼
//!    RateLimiter   EntropyValidator  PackAssembler   BanEngine     StateJournal
//!    (security)      (security)      (economy)      (security)     (this crate)
//!                                       │              │
//!                                  PityTracker      AuditLog
//!                                  RarityTable
//! ```
//!
//! ## Durability
//!
//! Pity counters, ban statuses, violations and the delivery ledger (every
//! pack handed out, with what it was rolled against) go through the
//! [`StateJournal`] before they change in memory, and are replayed on
//! startup. The audit trail is written by its own buffered thread and never
//! blocks an open.
//!
//! ## Example
//!
//! ```rust,ignore
//! use daddeck::{InMemoryCollection, PackService, ServiceConfig};
//! use daddeck_economy::PackType;
//! use daddeck_shared::{Fingerprint, SystemClock};
//! use std::sync::Arc;
//!
//! let config = ServiceConfig::from_file("data/packs.toml")?;
//! let service = PackService::from_config(
//!     &config,
//!     Arc::new(SystemClock),
//!     Arc::new(InMemoryCollection::new()),
//! )?;
//!
//! let pack = service.open_pack(&Fingerprint::new("device-1"), PackType::Standard)?;
//! println!("best card: {}", pack.best_rarity.as_str());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::perf)]

pub mod collection;
pub mod config;
pub mod error;
pub mod journal;
pub mod service;

pub use collection::{CollectionSink, InMemoryCollection, StorageError};
pub use config::{AuditConfig, EntropyConfig, ServiceConfig, StateConfig};
pub use error::{PackError, PackResult};
pub use journal::{Delivery, RecoveredState, StateJournal, StateRecord};
pub use service::{OpenRequest, PackService};
