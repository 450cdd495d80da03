//! # DadDeck Shared
//!
//! Common types used by the economy, security and service crates.
//!
//! ## CRITICAL RULE
//!
//! This crate must never grow game logic. It only answers three questions:
//! - What time is it? (`Clock`, `Timestamp`)
//! - Who is asking? (`Fingerprint`)
//! - What are the fixed engine limits? (`constants`)

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod constants;
pub mod identity;
pub mod time;

pub use constants::{CARDS_PER_PACK, COMMON_SLOTS, HOLO_ODDS_DENOMINATOR, MAX_BATCH_PACKS};
pub use identity::Fingerprint;
pub use time::{Clock, ManualClock, SystemClock, Timestamp};
