//! # Identity
//!
//! The device fingerprint is the unit of rate limiting, pity and banning.
//! The engine treats it as an opaque key.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque device/session fingerprint.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Prefix used for identities minted while fingerprinting is unavailable.
    pub const DEGRADED_PREFIX: &'static str = "degraded:";

    /// Wraps a provider-supplied fingerprint.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the raw fingerprint string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if this identity was minted in degraded mode.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.0.starts_with(Self::DEGRADED_PREFIX)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Fingerprint {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Fingerprint {
    fn from(value: String) -> Self {
        Self(value)
    }
}
