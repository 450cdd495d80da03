//! # Fingerprint Resolution
//!
//! The device fingerprint is the unit of identity. If the provider fails the
//! open is still allowed (fail-open), but under a `degraded:` identity so the
//! audit trail and the caller can tell.

use uuid::Uuid;

use daddeck_shared::Fingerprint;

use crate::error::SecurityResult;

/// Source of device fingerprints.
pub trait FingerprintProvider: Send + Sync {
    /// Fingerprint of the current device/session.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SecurityError::FingerprintUnavailable`] when the
    /// device cannot be fingerprinted.
    fn fingerprint(&self) -> SecurityResult<Fingerprint>;
}

/// A provider that always returns the same fingerprint.
impl FingerprintProvider for Fingerprint {
    fn fingerprint(&self) -> SecurityResult<Fingerprint> {
        Ok(self.clone())
    }
}

/// Identity resolved for one session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    /// Fingerprint used for pity, limits and bans.
    pub fingerprint: Fingerprint,
    /// True if fingerprinting failed and a session identity was minted.
    pub degraded: bool,
}

/// Resolves an identity, failing open on provider errors.
///
/// `session_hint` keys the degraded identity so one session keeps one
/// identity across calls; pass `None` to mint a random one.
pub fn resolve_identity(provider: &dyn FingerprintProvider, session_hint: Option<&str>) -> Identity {
    match provider.fingerprint() {
        Ok(fingerprint) => Identity {
            degraded: fingerprint.is_degraded(),
            fingerprint,
        },
        Err(e) => {
            let suffix = session_hint.map_or_else(|| Uuid::new_v4().to_string(), str::to_owned);
            let fingerprint = Fingerprint::new(format!("{}{suffix}", Fingerprint::DEGRADED_PREFIX));
            tracing::warn!(
                "Fingerprinting unavailable ({}), continuing degraded as {}",
                e,
                fingerprint
            );
            Identity {
                fingerprint,
                degraded: true,
            }
        }
    }
}
