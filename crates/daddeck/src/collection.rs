//! Where validated packs go. The store itself lives outside the engine.

use std::collections::HashMap;

use parking_lot::RwLock;
use thiserror::Error;

use daddeck_economy::Pack;
use daddeck_shared::Fingerprint;

/// The collection store refused a write.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct StorageError(pub String);

/// Collection store. Called once per accepted pack; never retried.
pub trait CollectionSink: Send + Sync {
    /// Stores `pack` in the owner's collection.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the store is unavailable.
    fn add_pack_to_collection(&self, fingerprint: &Fingerprint, pack: &Pack) -> Result<(), StorageError>;
}

/// In-memory collection for tests and simulations.
#[derive(Debug, Default)]
pub struct InMemoryCollection {
    packs: RwLock<HashMap<Fingerprint, Vec<Pack>>>,
}

impl InMemoryCollection {
    /// Empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Packs stored for one identity, oldest first.
    #[must_use]
    pub fn packs_for(&self, fingerprint: &Fingerprint) -> Vec<Pack> {
        self.packs.read().get(fingerprint).cloned().unwrap_or_default()
    }

    /// Packs stored across all identities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.packs.read().values().map(Vec::len).sum()
    }

    /// True when nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CollectionSink for InMemoryCollection {
    fn add_pack_to_collection(&self, fingerprint: &Fingerprint, pack: &Pack) -> Result<(), StorageError> {
        self.packs
            .write()
            .entry(fingerprint.clone())
            .or_default()
            .push(pack.clone());
        Ok(())
    }
}
