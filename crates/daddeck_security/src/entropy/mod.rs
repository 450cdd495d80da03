//! # Pack Entropy
//!
//! Every pack is committed to before its cards exist.
//!
//! ```text
//! server_nonce  = 16 fresh random bytes per open
//! server_seed   = SipHash-2-4(server_secret, pack_id || server_nonce)  (2 lanes, 32 bytes)
//! combined_hash = SHA-256(client_seed || server_seed || pack_id)
//! cards         = assemble(ChaCha20(combined_hash), pity counter before open)
//! ```
//!
//! The server seed is reproducible only with the server secret, so a client
//! cannot mint its own self-consistent entropy. The nonce makes it unknown
//! until the open, even for a pack id the client has used before. Given the
//! pre-open pity counter, the server can replay the assembly and compare
//! card for card.
//!
//! ## Checks
//!
//! | Anomaly | Violation |
//! |---------|-----------|
//! | hash does not recompute, foreign server seed, entropy swapped | `entropy_mismatch` |
//! | slot-policy fault, cards not derivable, pack never issued | `pack_manipulation` |
//! | pack id already seen from this identity in the window | `duplicate_detection` |

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hasher;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use sha2::{Digest, Sha256};
use siphasher::sip128::{Hasher128, SipHasher24};
use uuid::Uuid;

use daddeck_economy::{Pack, PackAssembler, PackEntropy, PityCounter, StructureFault};
use daddeck_shared::{Fingerprint, Timestamp};

use crate::ban::ViolationKind;
use crate::error::{SecurityError, SecurityResult};

/// 256-bit server secret. Never leaves the server.
#[derive(Clone)]
pub struct ServerSecret {
    keys: [u64; 4],
}

impl ServerSecret {
    /// Wraps raw secret bytes.
    #[must_use]
    pub fn new(bytes: &[u8; 32]) -> Self {
        let mut keys = [0u64; 4];
        for (key, chunk) in keys.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            *key = u64::from_le_bytes(word);
        }
        Self { keys }
    }

    /// Parses 64 hex characters.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::InvalidSecret`] for bad hex or length.
    pub fn from_hex(hex_str: &str) -> SecurityResult<Self> {
        let bytes = hex::decode(hex_str.trim()).map_err(|e| SecurityError::InvalidSecret(e.to_string()))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            SecurityError::InvalidSecret(format!("expected 32 bytes, got {}", v.len()))
        })?;
        Ok(Self::new(&bytes))
    }

    /// Fresh secret from a CSPRNG.
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 32];
        rng.fill(&mut bytes);
        Self::new(&bytes)
    }

    /// Server seed for one open of a pack id.
    #[must_use]
    pub fn derive_seed(&self, pack_id: &Uuid, nonce: &[u8; 16]) -> [u8; 32] {
        let mut seed = [0u8; 32];
        for (lane, out) in seed.chunks_exact_mut(16).enumerate() {
            let (k0, k1) = if lane == 0 {
                (self.keys[0], self.keys[1])
            } else {
                (self.keys[2], self.keys[3])
            };
            let mut hasher = SipHasher24::new_with_keys(k0, k1);
            hasher.write(pack_id.as_bytes());
            hasher.write(nonce);
            hasher.write_u8(u8::try_from(lane).unwrap_or(u8::MAX));
            let hash = hasher.finish128();
            out[..8].copy_from_slice(&hash.h1.to_le_bytes());
            out[8..].copy_from_slice(&hash.h2.to_le_bytes());
        }
        seed
    }
}

impl fmt::Debug for ServerSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSecret")
            .field("keys", &"[REDACTED]")
            .finish()
    }
}

/// One thing wrong with a pack or its entropy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Anomaly {
    /// `combined_hash` does not recompute from the seeds and pack id.
    HashMismatch,
    /// The server seed was not derived from this server's secret.
    ForeignServerSeed,
    /// The pack carries different entropy than was committed.
    EntropySwapped,
    /// The cards break the slot policy or the catalog.
    Structure(StructureFault),
    /// The cards are not what the committed entropy produces.
    NotDerivable,
    /// The server never issued this pack to this identity.
    NotIssued,
    /// The pack id was already seen from this identity.
    DuplicatePack {
        /// First sighting.
        first_seen: Timestamp,
    },
}

impl Anomaly {
    /// Violation category.
    #[must_use]
    pub const fn kind(&self) -> ViolationKind {
        match self {
            Self::HashMismatch | Self::ForeignServerSeed | Self::EntropySwapped => {
                ViolationKind::EntropyMismatch
            }
            Self::Structure(_) | Self::NotDerivable | Self::NotIssued => {
                ViolationKind::PackManipulation
            }
            Self::DuplicatePack { .. } => ViolationKind::DuplicateDetection,
        }
    }
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HashMismatch => f.write_str("combined hash does not match seeds"),
            Self::ForeignServerSeed => f.write_str("server seed not issued by this server"),
            Self::EntropySwapped => f.write_str("pack entropy differs from the committed entropy"),
            Self::Structure(fault) => write!(f, "structure: {fault}"),
            Self::NotDerivable => f.write_str("cards are not derivable from committed entropy"),
            Self::NotIssued => f.write_str("pack was not issued to this identity"),
            Self::DuplicatePack { first_seen } => {
                write!(f, "pack id already seen at {}ms", first_seen.as_millis())
            }
        }
    }
}

/// What the server knows that lets it replay an open.
#[derive(Clone, Copy, Debug)]
pub struct ReplayContext<'a> {
    /// Assembler the pack should have come from.
    pub assembler: &'a PackAssembler,
    /// Pity counter before the open, when known. Enables card-for-card replay.
    pub counter_before: Option<&'a PityCounter>,
}

/// Verdict on a pack.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidationResult {
    /// No anomalies.
    pub valid: bool,
    /// Everything found, in check order.
    pub anomalies: Vec<Anomaly>,
    /// Hash, server seed and commitment all check out.
    pub entropy_verified: bool,
    /// The pack id is a repeat.
    pub duplicate_detected: bool,
}

impl ValidationResult {
    /// Verdict from a list of anomalies.
    #[must_use]
    pub fn from_anomalies(anomalies: Vec<Anomaly>) -> Self {
        let entropy_verified = !anomalies
            .iter()
            .any(|a| a.kind() == ViolationKind::EntropyMismatch);
        let duplicate_detected = anomalies
            .iter()
            .any(|a| matches!(a, Anomaly::DuplicatePack { .. }));
        Self {
            valid: anomalies.is_empty(),
            anomalies,
            entropy_verified,
            duplicate_detected,
        }
    }

    /// Most serious violation category present: duplicate, then
    /// manipulation, then mismatch.
    #[must_use]
    pub fn violation_kind(&self) -> Option<ViolationKind> {
        self.anomalies.iter().map(Anomaly::kind).max_by_key(|kind| match kind {
            ViolationKind::DuplicateDetection => 2,
            ViolationKind::PackManipulation => 1,
            ViolationKind::EntropyMismatch => 0,
        })
    }

    /// All anomalies joined for logs and violation details.
    #[must_use]
    pub fn describe(&self) -> String {
        self.anomalies
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Issues and checks pack entropy; remembers recent pack ids per identity.
pub struct EntropyValidator {
    secret: ServerSecret,
    duplicate_window: Duration,
    recent: Mutex<HashMap<Fingerprint, VecDeque<(Uuid, Timestamp)>>>,
}

impl EntropyValidator {
    /// Default duplicate window.
    pub const DEFAULT_DUPLICATE_WINDOW: Duration = Duration::from_secs(10 * 60);

    /// Creates a validator.
    #[must_use]
    pub fn new(secret: ServerSecret, duplicate_window: Duration) -> Self {
        Self {
            secret,
            duplicate_window,
            recent: Mutex::new(HashMap::new()),
        }
    }

    /// `SHA-256(client_seed || server_seed || pack_id)`.
    #[must_use]
    pub fn combined_hash(client_seed: &[u8; 32], server_seed: &[u8; 32], pack_id: &Uuid) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(client_seed);
        hasher.update(server_seed);
        hasher.update(pack_id.as_bytes());
        let mut out = [0u8; 32];
        out.copy_from_slice(&hasher.finalize());
        out
    }

    /// Commits entropy for `pack_id`. The server nonce always comes from
    /// `rng`; the client seed too when the client did not send one.
    pub fn create<R: Rng + ?Sized>(
        &self,
        pack_id: &Uuid,
        client_seed: Option<[u8; 32]>,
        rng: &mut R,
    ) -> PackEntropy {
        let client_seed = client_seed.unwrap_or_else(|| {
            let mut seed = [0u8; 32];
            rng.fill(&mut seed);
            seed
        });
        let mut server_nonce = [0u8; 16];
        rng.fill(&mut server_nonce);
        let server_seed = self.secret.derive_seed(pack_id, &server_nonce);
        PackEntropy {
            client_seed,
            server_nonce,
            server_seed,
            combined_hash: Self::combined_hash(&client_seed, &server_seed, pack_id),
        }
    }

    /// Entropy and card checks. Pure: does not touch the duplicate registry.
    #[must_use]
    pub fn verify(
        &self,
        pack: &Pack,
        committed: &PackEntropy,
        replay: Option<ReplayContext<'_>>,
    ) -> ValidationResult {
        let mut anomalies = Vec::new();

        let recomputed =
            Self::combined_hash(&committed.client_seed, &committed.server_seed, &pack.id);
        if recomputed != committed.combined_hash {
            anomalies.push(Anomaly::HashMismatch);
        }
        if self.secret.derive_seed(&pack.id, &committed.server_nonce) != committed.server_seed {
            anomalies.push(Anomaly::ForeignServerSeed);
        }
        if pack.entropy != *committed {
            anomalies.push(Anomaly::EntropySwapped);
        }

        if let Some(ctx) = replay {
            anomalies.extend(ctx.assembler.check_structure(pack).into_iter().map(Anomaly::Structure));

            if let Some(counter) = ctx.counter_before {
                let mut header = pack.header();
                header.entropy = *committed;
                let derivable = ctx
                    .assembler
                    .assemble_pack(&header, counter)
                    .is_ok_and(|expected| {
                        expected.cards == pack.cards && expected.best_rarity == pack.best_rarity
                    });
                if !derivable {
                    anomalies.push(Anomaly::NotDerivable);
                }
            }
        }

        ValidationResult::from_anomalies(anomalies)
    }

    /// Full validation: [`EntropyValidator::verify`] plus the duplicate
    /// check. Registers the pack id for `fingerprint`.
    #[must_use]
    pub fn validate(
        &self,
        pack: &Pack,
        committed: &PackEntropy,
        fingerprint: &Fingerprint,
        now: Timestamp,
        replay: Option<ReplayContext<'_>>,
    ) -> ValidationResult {
        let mut result = self.verify(pack, committed, replay);
        if let Some(first_seen) = self.register(fingerprint, pack.id, now) {
            let mut anomalies = std::mem::take(&mut result.anomalies);
            anomalies.push(Anomaly::DuplicatePack { first_seen });
            result = ValidationResult::from_anomalies(anomalies);
        }
        result
    }

    /// Records a sighting. Returns the earlier sighting if this is a repeat
    /// inside the window.
    pub fn register(&self, fingerprint: &Fingerprint, pack_id: Uuid, now: Timestamp) -> Option<Timestamp> {
        let cutoff = now.saturating_sub(self.duplicate_window);
        let mut recent = self.recent.lock();
        let seen = recent.entry(fingerprint.clone()).or_default();

        while seen.front().is_some_and(|&(_, at)| at < cutoff) {
            seen.pop_front();
        }

        if let Some(&(_, first_seen)) = seen.iter().find(|(id, _)| *id == pack_id) {
            return Some(first_seen);
        }
        seen.push_back((pack_id, now));
        None
    }

    /// Drops a sighting so the same pack can be submitted again, e.g. after
    /// the collection store refused it.
    pub fn forget(&self, fingerprint: &Fingerprint, pack_id: Uuid) {
        if let Some(seen) = self.recent.lock().get_mut(fingerprint) {
            seen.retain(|(id, _)| *id != pack_id);
        }
    }

    /// Forgets identities with nothing inside the window.
    pub fn sweep(&self, now: Timestamp) {
        let cutoff = now.saturating_sub(self.duplicate_window);
        self.recent.lock().retain(|_, seen| {
            while seen.front().is_some_and(|&(_, at)| at < cutoff) {
                seen.pop_front();
            }
            !seen.is_empty()
        });
    }
}

impl fmt::Debug for EntropyValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntropyValidator")
            .field("secret", &self.secret)
            .field("duplicate_window", &self.duplicate_window)
            .finish_non_exhaustive()
    }
}
