//! # DadDeck Security - The Gatekeeper
//!
//! Everything that stands between a client and a pack.
//!
//! ## Features
//!
//! - **Entropy**: server-seeded commitments that let the server re-derive any pack
//! - **Rate Limiting**: sliding windows per identity and action class
//! - **Bans**: violation escalation with immediate and threshold triggers
//! - **Audit**: append-only record of opens, blocks, violations and bans
//!
//! ## Architecture
//!
//! ```text
//! open request
//!     │
//!     ├── BanEngine::is_banned ──────► blocked ──┐
//!     ├── RateLimiter::check ────────► blocked ──┤
//!     │                                           │
//!     ├── EntropyValidator::create                │
//!     │       (pack assembled by the economy)     │
//!     ├── EntropyValidator::verify ──► anomaly ───┼──► BanEngine::add_violation
//!     │                                           │            │
//!     ▼                                           ▼            ▼
//!  pack opened ─────────────────────────────► AuditLog ◄───────┘
//!                                               │
//!                                               ▼
//!                                        AuditJournal (JSON lines)
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::perf)]

pub mod audit;
pub mod ban;
pub mod entropy;
pub mod error;
pub mod fingerprint;
pub mod rate_limit;

pub use audit::{
    AuditEvent, AuditJournal, AuditJournalConfig, AuditLog, AuditRecord, BlockReason, LogStats,
    ViolationStats,
};
pub use ban::{BanDecision, BanEngine, BanPolicy, BanStatus, SecurityViolation, Severity, Standing, ViolationKind};
pub use entropy::{Anomaly, EntropyValidator, ReplayContext, ServerSecret, ValidationResult};
pub use error::{SecurityError, SecurityResult};
pub use fingerprint::{resolve_identity, FingerprintProvider, Identity};
pub use rate_limit::{ActionClass, RateLimitPolicy, RateLimitRule, RateLimitStatus, RateLimiter};
