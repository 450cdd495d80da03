//! # Pack Service
//!
//! **The counter every pack is handed over.** Nothing leaves without passing
//! the whole pipeline.
//!
//! ## The Open Pipeline
//!
//! ```text
//! open_pack(fingerprint, pack_type)
//!        │
//!        ▼  (identity lock held from here to the end)
//!   Ban check ──────────── banned ──────► Banned          (audit: blocked)
//!        │
//!   Delivery ledger ────── own id ──────► same Pack again (no mutation)
//!        │             └──── other's id ──► DuplicateDetected
//!   Rate limit check ───── full ────────► RateLimited     (audit: blocked)
//!        │
//!   Entropy commit (client seed + server nonce + keyed server seed)
//!        │
//!   Assemble (pity-adjusted rolls) ──────► CatalogExhausted
//!        │
//!   Self-check (re-derive from entropy) ─► pack discarded
//!        │
//!   State journal (pity + delivery) ─────► StorageUnavailable
//!        │
//!   Charge rate limit, apply pity, record delivery, audit "pack_opened"
//!        ▼
//!      Pack
//! ```
//!
//! Nothing is charged or applied until the journal has the new state, so a
//! failed open costs no quota.
//!
//! ## Submission
//!
//! `submit_pack` is the other way in: a client hands a pack back for
//! collection storage. Every pack is checked card for card against the
//! delivery ledger; a pack the ledger does not know is manipulation, one
//! already stored is a duplicate. Failures become violations and go to the
//! ban engine.
//!
//! ## Thread Safety
//!
//! `PackService` is `Send + Sync`. Each identity has its own lock, held for
//! the whole of an open, so pity and rate-limit updates for one identity are
//! serialized while different identities run in parallel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use uuid::Uuid;

use daddeck_economy::{Pack, PackAssembler, PackHeader, PackType, PityCounter};
use daddeck_security::{
    resolve_identity, ActionClass, AuditEvent, AuditLog, BanEngine, BanStatus, BlockReason,
    Anomaly, EntropyValidator, FingerprintProvider, Identity, RateLimitStatus, RateLimiter,
    ReplayContext, SecurityViolation, ValidationResult, ViolationKind,
};
use daddeck_shared::constants::MAX_BATCH_PACKS;
use daddeck_shared::{Clock, Fingerprint, Timestamp};

use crate::collection::CollectionSink;
use crate::config::ServiceConfig;
use crate::error::{PackError, PackResult};
use crate::journal::{Delivery, RecoveredState, StateJournal, StateRecord};

/// One open request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenRequest {
    /// Who is opening.
    pub fingerprint: Fingerprint,
    /// Product line.
    pub pack_type: PackType,
    /// Idempotency key. A retry with the same id returns the same pack; an
    /// id already delivered to another identity is refused.
    pub pack_id: Option<Uuid>,
    /// Client contribution to the entropy. Drawn server-side when absent.
    pub client_seed: Option<[u8; 32]>,
}

impl OpenRequest {
    /// Request with a fresh pack id and a server-drawn client seed.
    #[must_use]
    pub fn new(fingerprint: Fingerprint, pack_type: PackType) -> Self {
        Self {
            fingerprint,
            pack_type,
            pack_id: None,
            client_seed: None,
        }
    }

    /// Sets the idempotency key.
    #[must_use]
    pub fn with_pack_id(mut self, pack_id: Uuid) -> Self {
        self.pack_id = Some(pack_id);
        self
    }

    /// Sets the client seed.
    #[must_use]
    pub fn with_client_seed(mut self, seed: [u8; 32]) -> Self {
        self.client_seed = Some(seed);
        self
    }
}

/// Everything one identity owns.
#[derive(Debug, Default)]
struct IdentitySlot {
    counter: PityCounter,
}

/// Holds a client-supplied pack id while its open is in flight.
struct Claim<'a> {
    claims: &'a Mutex<HashSet<Uuid>>,
    pack_id: Uuid,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.claims.lock().remove(&self.pack_id);
    }
}

/// The pack service.
///
/// ## Usage
///
/// ```rust,ignore
/// let config = ServiceConfig::from_file("data/packs.toml")?;
/// let service = PackService::from_config(
///     &config,
///     Arc::new(SystemClock),
///     Arc::new(InMemoryCollection::new()),
/// )?;
///
/// let pack = service.open_pack(&fingerprint, PackType::Standard)?;
/// service.submit_pack(&fingerprint, &pack)?;
/// ```
pub struct PackService {
    /// Rarity tables, pity and catalog.
    assembler: PackAssembler,
    /// Entropy commitments and the duplicate registry.
    validator: EntropyValidator,
    /// Per-identity sliding windows.
    limiter: RateLimiter,
    /// Violations and bans.
    bans: BanEngine,
    /// Shared with the ban engine.
    audit: Arc<AuditLog>,
    /// Durable pity, ban and delivery state. `None` runs in memory only.
    journal: Option<StateJournal>,
    /// Where accepted submissions go.
    collection: Arc<dyn CollectionSink>,
    /// Time source.
    clock: Arc<dyn Clock>,
    /// Server-side randomness for client seeds.
    rng: Mutex<ChaCha20Rng>,
    /// Identity slots. The map lock is never held across an open.
    identities: RwLock<HashMap<Fingerprint, Arc<Mutex<IdentitySlot>>>>,
    /// Every pack handed out, by id.
    deliveries: RwLock<HashMap<Uuid, Delivery>>,
    /// Client-supplied ids with an open in progress.
    claims: Mutex<HashSet<Uuid>>,
}

impl PackService {
    /// Builds the service and restores persisted state.
    ///
    /// # Errors
    ///
    /// Returns [`PackError::Config`] for invalid balance data,
    /// [`PackError::CatalogExhausted`] for an incomplete catalog, and
    /// [`PackError::StorageUnavailable`] if a journal cannot be opened.
    pub fn from_config(
        config: &ServiceConfig,
        clock: Arc<dyn Clock>,
        collection: Arc<dyn CollectionSink>,
    ) -> PackResult<Self> {
        let assembler = config.economy.build_assembler()?;

        let mut rng = match config.entropy.rng_seed {
            Some(seed) => ChaCha20Rng::seed_from_u64(seed),
            None => ChaCha20Rng::from_entropy(),
        };
        let secret = config.entropy.server_secret(&mut rng)?;

        let audit = Arc::new(match &config.audit.journal_path {
            Some(path) => AuditLog::open(path, config.audit.writer)?,
            None => AuditLog::new(),
        });

        let (journal, recovered) = match &config.state.journal_path {
            Some(path) => {
                let (journal, state) = StateJournal::open(path)?;
                (Some(journal), state)
            }
            None => {
                tracing::warn!(
                    "No state journal configured: pity, bans and delivered packs last only until restart"
                );
                (None, RecoveredState::default())
            }
        };

        let service = Self {
            assembler,
            validator: EntropyValidator::new(secret, config.entropy.duplicate_window()),
            limiter: RateLimiter::new(config.rate_limits),
            bans: BanEngine::new(config.ban, Arc::clone(&audit)),
            audit,
            journal,
            collection,
            clock,
            rng: Mutex::new(rng),
            identities: RwLock::new(HashMap::new()),
            deliveries: RwLock::new(HashMap::new()),
            claims: Mutex::new(HashSet::new()),
        };
        service.restore(recovered);
        Ok(service)
    }

    fn restore(&self, state: RecoveredState) {
        if state.is_empty() {
            return;
        }
        let (identities, bans, violations, deliveries) = (
            state.pity.len(),
            state.bans.len(),
            state.violations.len(),
            state.deliveries.len(),
        );

        {
            let mut slots = self.identities.write();
            for (fingerprint, counter) in state.pity {
                slots.insert(fingerprint, Arc::new(Mutex::new(IdentitySlot { counter })));
            }
        }
        *self.deliveries.write() = state.deliveries;
        for violation in state.violations {
            self.bans.restore_violation(violation);
        }
        for (fingerprint, status) in state.bans {
            self.bans.restore_status(fingerprint, status);
        }

        tracing::info!(
            "Restored {} pity counters, {} ban statuses, {} violations, {} deliveries",
            identities,
            bans,
            violations,
            deliveries
        );
    }

    // ========================================================================
    // Opening
    // ========================================================================

    /// Opens one pack with a fresh id.
    ///
    /// # Errors
    ///
    /// See [`PackService::open`].
    pub fn open_pack(&self, fingerprint: &Fingerprint, pack_type: PackType) -> PackResult<Pack> {
        self.open(OpenRequest::new(fingerprint.clone(), pack_type))
    }

    /// Opens one pack.
    ///
    /// Replaying a request whose `pack_id` was already delivered to this
    /// identity returns the same pack and changes nothing, across restarts
    /// when a state journal is configured.
    ///
    /// # Errors
    ///
    /// - [`PackError::Banned`] / [`PackError::RateLimited`]: refused, nothing mutated
    /// - [`PackError::DuplicateDetected`]: `pack_id` belongs to another
    ///   identity or is being opened right now
    /// - [`PackError::CatalogExhausted`]: the catalog cannot fill a slot
    /// - [`PackError::EntropyMismatch`] / [`PackError::PackManipulation`]:
    ///   the pack failed its own re-derivation and was discarded
    /// - [`PackError::StorageUnavailable`]: the state journal refused the write
    pub fn open(&self, request: OpenRequest) -> PackResult<Pack> {
        let now = self.clock.now();
        let fingerprint = &request.fingerprint;
        let slot = self.slot(fingerprint);
        let mut slot = slot.lock();

        self.check_ban(fingerprint, now)?;

        let (pack_id, _claim) = match request.pack_id {
            Some(id) => {
                let claim = self
                    .claim(id)
                    .ok_or_else(|| Self::refuse_reuse(fingerprint, id, "open in progress"))?;
                if let Some(delivery) = self.delivery(&id) {
                    return self.redeliver(fingerprint, &delivery);
                }
                (id, Some(claim))
            }
            None => (Uuid::new_v4(), None),
        };

        let class = ActionClass::for_pack(request.pack_type);
        self.check_limit(fingerprint, class, now)?;

        let counter_before = slot.counter;
        let (pack, counter_after) = self.roll(
            request.pack_type,
            pack_id,
            request.client_seed,
            &counter_before,
            now,
        )?;
        let delivery = Delivery::new(fingerprint.clone(), pack.header(), counter_before);

        self.persist(&[
            StateRecord::Pity {
                fingerprint: fingerprint.clone(),
                counter: counter_after,
            },
            StateRecord::Delivery(delivery.clone()),
        ])?;

        self.limiter.record(fingerprint, class, now);
        slot.counter = counter_after;
        self.deliveries.write().insert(pack.id, delivery);
        self.audit_open(fingerprint, &pack, now);
        Ok(pack)
    }

    /// Opens `count` packs in one go, charged once against the batch limit.
    /// Pity advances pack by pack; the batch is all-or-nothing.
    ///
    /// # Errors
    ///
    /// [`PackError::InvalidBatchSize`] for `count` outside
    /// `1..=MAX_BATCH_PACKS`, otherwise as [`PackService::open`].
    pub fn open_batch(
        &self,
        fingerprint: &Fingerprint,
        pack_type: PackType,
        count: usize,
    ) -> PackResult<Vec<Pack>> {
        if count == 0 || count > MAX_BATCH_PACKS {
            return Err(PackError::InvalidBatchSize { count });
        }

        let now = self.clock.now();
        let slot = self.slot(fingerprint);
        let mut slot = slot.lock();

        self.check_ban(fingerprint, now)?;
        self.check_limit(fingerprint, ActionClass::BatchPack, now)?;

        let mut counter = slot.counter;
        let mut packs = Vec::with_capacity(count);
        let mut deliveries = Vec::with_capacity(count);
        for _ in 0..count {
            let counter_before = counter;
            let (pack, counter_after) =
                self.roll(pack_type, Uuid::new_v4(), None, &counter_before, now)?;
            counter = counter_after;
            deliveries.push(Delivery::new(fingerprint.clone(), pack.header(), counter_before));
            packs.push(pack);
        }

        let mut records = Vec::with_capacity(count + 1);
        records.push(StateRecord::Pity {
            fingerprint: fingerprint.clone(),
            counter,
        });
        records.extend(deliveries.iter().cloned().map(StateRecord::Delivery));
        self.persist(&records)?;

        self.limiter.record(fingerprint, ActionClass::BatchPack, now);
        slot.counter = counter;
        self.deliveries
            .write()
            .extend(deliveries.into_iter().map(|d| (d.header.id, d)));
        for pack in &packs {
            self.audit_open(fingerprint, pack, now);
        }
        tracing::debug!("Opened batch of {} for {}", count, fingerprint);
        Ok(packs)
    }

    /// Opens a pack for whatever identity `provider` resolves to. If
    /// fingerprinting fails the open still happens under a degraded identity.
    ///
    /// # Errors
    ///
    /// As [`PackService::open`].
    pub fn open_with_provider(
        &self,
        provider: &dyn FingerprintProvider,
        session_hint: Option<&str>,
        pack_type: PackType,
    ) -> PackResult<(Identity, Pack)> {
        let identity = resolve_identity(provider, session_hint);
        let pack = self.open_pack(&identity.fingerprint, pack_type)?;
        Ok((identity, pack))
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Validates a pack a client hands back and forwards it to the
    /// collection store.
    ///
    /// The pack must be in the delivery ledger under this identity and match
    /// what was handed out card for card. The ledger remembers stored packs,
    /// so a second submission is a duplicate however late it comes.
    ///
    /// # Errors
    ///
    /// - [`PackError::Banned`]: refused
    /// - [`PackError::EntropyMismatch`], [`PackError::PackManipulation`],
    ///   [`PackError::DuplicateDetected`]: recorded as a violation
    /// - [`PackError::StorageUnavailable`]: the journal or the store refused;
    ///   the pack can be submitted again
    pub fn submit_pack(&self, fingerprint: &Fingerprint, pack: &Pack) -> PackResult<()> {
        let now = self.clock.now();
        let slot = self.slot(fingerprint);
        let _slot = slot.lock();

        self.check_ban(fingerprint, now)?;

        let delivery = match self.delivery(&pack.id) {
            Some(delivery) if delivery.owner == *fingerprint => delivery,
            _ => {
                let result = ValidationResult::from_anomalies(vec![Anomaly::NotIssued]);
                return Err(self.route_violation(fingerprint, &result, pack.id, now));
            }
        };

        let mut result = self.validator.validate(
            pack,
            &delivery.header.entropy,
            fingerprint,
            now,
            Some(ReplayContext {
                assembler: &self.assembler,
                counter_before: Some(&delivery.counter_before),
            }),
        );
        if let Some(first_seen) = delivery.submitted_at {
            if !result.duplicate_detected {
                let mut anomalies = std::mem::take(&mut result.anomalies);
                anomalies.push(Anomaly::DuplicatePack { first_seen });
                result = ValidationResult::from_anomalies(anomalies);
            }
        }
        if !result.valid {
            return Err(self.route_violation(fingerprint, &result, pack.id, now));
        }

        let submitted = Delivery {
            submitted_at: Some(now),
            ..delivery.clone()
        };
        if let Err(e) = self.persist(&[StateRecord::Delivery(submitted.clone())]) {
            self.validator.forget(fingerprint, pack.id);
            return Err(e);
        }
        self.deliveries.write().insert(pack.id, submitted);

        self.collection
            .add_pack_to_collection(fingerprint, pack)
            .map_err(|e| {
                tracing::warn!("Collection store refused pack {}: {}", pack.id, e);
                // Logged inside.
                let _ = self.persist(&[StateRecord::Delivery(delivery.clone())]);
                self.deliveries.write().insert(pack.id, delivery);
                self.validator.forget(fingerprint, pack.id);
                PackError::StorageUnavailable(e.to_string())
            })
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Current pity counter for an identity.
    #[must_use]
    pub fn pity_counter(&self, fingerprint: &Fingerprint) -> PityCounter {
        self.identities
            .read()
            .get(fingerprint)
            .map(|slot| slot.lock().counter)
            .unwrap_or_default()
    }

    /// Current ban status for an identity.
    #[must_use]
    pub fn ban_status(&self, fingerprint: &Fingerprint) -> BanStatus {
        self.bans.is_banned(fingerprint)
    }

    /// Rate-limit window for an identity and class, without consuming it.
    #[must_use]
    pub fn rate_limit_status(&self, fingerprint: &Fingerprint, class: ActionClass) -> RateLimitStatus {
        self.limiter.check(fingerprint, class, self.clock.now())
    }

    /// The assembler packs are rolled with.
    #[must_use]
    pub const fn assembler(&self) -> &PackAssembler {
        &self.assembler
    }

    /// The audit log.
    #[must_use]
    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// The ban engine.
    #[must_use]
    pub const fn bans(&self) -> &BanEngine {
        &self.bans
    }

    /// The delivery record for a pack id, if it was ever handed out.
    #[must_use]
    pub fn delivery(&self, pack_id: &Uuid) -> Option<Delivery> {
        self.deliveries.read().get(pack_id).cloned()
    }

    /// The state journal, if persistence is on.
    #[must_use]
    pub const fn journal(&self) -> Option<&StateJournal> {
        self.journal.as_ref()
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Drops idle rate-limit windows and expired duplicate-registry entries.
    /// Returns how many rate-limit windows were dropped.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        self.validator.sweep(now);
        self.limiter.sweep(now)
    }

    /// Rewrites the state journal with one record per key.
    ///
    /// # Errors
    ///
    /// Returns [`PackError::StorageUnavailable`] on IO failure.
    pub fn compact_journal(&self) -> PackResult<usize> {
        match &self.journal {
            Some(journal) => journal.compact(),
            None => Ok(0),
        }
    }

    /// Flushes the audit writer and fsyncs the state journal.
    ///
    /// # Errors
    ///
    /// Returns [`PackError::StorageUnavailable`] on IO failure.
    pub fn flush(&self) -> PackResult<()> {
        self.audit.flush();
        if let Some(journal) = &self.journal {
            journal.sync()?;
        }
        Ok(())
    }

    // ========================================================================
    // Pipeline steps
    // ========================================================================

    fn slot(&self, fingerprint: &Fingerprint) -> Arc<Mutex<IdentitySlot>> {
        if let Some(slot) = self.identities.read().get(fingerprint) {
            return Arc::clone(slot);
        }
        Arc::clone(self.identities.write().entry(fingerprint.clone()).or_default())
    }

    fn check_ban(&self, fingerprint: &Fingerprint, now: Timestamp) -> PackResult<()> {
        let status = self.bans.is_banned(fingerprint);
        if !status.is_banned {
            return Ok(());
        }
        self.audit.record(
            fingerprint.clone(),
            now,
            AuditEvent::OpenBlocked {
                block: BlockReason::Banned,
            },
        );
        Err(PackError::Banned {
            reason: status.reason.unwrap_or_default(),
        })
    }

    /// Refuses when the window is full. Consumes nothing.
    fn check_limit(
        &self,
        fingerprint: &Fingerprint,
        class: ActionClass,
        now: Timestamp,
    ) -> PackResult<()> {
        let status = self.limiter.check(fingerprint, class, now);
        if !status.is_blocked {
            return Ok(());
        }
        tracing::warn!(
            "Rate limited {} on {} (retry in {}ms)",
            fingerprint,
            class,
            status.retry_after(now).as_millis()
        );
        self.audit.record(
            fingerprint.clone(),
            now,
            AuditEvent::OpenBlocked {
                block: BlockReason::RateLimited { class },
            },
        );
        Err(PackError::RateLimited { class, status })
    }

    fn claim(&self, pack_id: Uuid) -> Option<Claim<'_>> {
        self.claims.lock().insert(pack_id).then_some(Claim {
            claims: &self.claims,
            pack_id,
        })
    }

    /// Rebuilds a delivered pack for its owner; refuses anyone else.
    fn redeliver(&self, fingerprint: &Fingerprint, delivery: &Delivery) -> PackResult<Pack> {
        let pack_id = delivery.header.id;
        if delivery.owner != *fingerprint {
            return Err(Self::refuse_reuse(fingerprint, pack_id, "delivered to another identity"));
        }
        tracing::debug!("Replayed open {} for {}", pack_id, fingerprint);
        self.assembler
            .assemble_pack(&delivery.header, &delivery.counter_before)
            .map_err(|e| {
                tracing::error!("Pack {} could not be rebuilt: {}", pack_id, e);
                PackError::from(e)
            })
    }

    fn refuse_reuse(fingerprint: &Fingerprint, pack_id: Uuid, why: &str) -> PackError {
        tracing::warn!("Refused pack id {} for {}: {}", pack_id, fingerprint, why);
        PackError::DuplicateDetected { pack_id }
    }

    /// Commits entropy, assembles, re-derives, and advances pity. Mutates
    /// nothing.
    fn roll(
        &self,
        pack_type: PackType,
        pack_id: Uuid,
        client_seed: Option<[u8; 32]>,
        counter: &PityCounter,
        now: Timestamp,
    ) -> PackResult<(Pack, PityCounter)> {
        let entropy = {
            let mut rng = self.rng.lock();
            self.validator.create(&pack_id, client_seed, &mut *rng)
        };
        let header = PackHeader {
            id: pack_id,
            pack_type,
            opened_at: now,
            entropy,
        };

        let pack = self.assembler.assemble_pack(&header, counter).map_err(|e| {
            tracing::error!("Pack {} could not be assembled: {}", pack_id, e);
            PackError::from(e)
        })?;

        let check = self.validator.verify(
            &pack,
            &entropy,
            Some(ReplayContext {
                assembler: &self.assembler,
                counter_before: Some(counter),
            }),
        );
        if let Some(kind) = check.violation_kind() {
            tracing::error!("Pack {} failed its own check: {}", pack_id, check.describe());
            return Err(PackError::from_violation(kind, pack_id, check.describe()));
        }

        let counter_after = self.assembler.tracker().update(counter, pack.rarities(), now);
        Ok((pack, counter_after))
    }

    fn persist(&self, records: &[StateRecord]) -> PackResult<()> {
        if let Some(journal) = &self.journal {
            journal.append_all(records).map_err(|e| {
                tracing::error!("State journal write failed: {}", e);
                e
            })?;
        }
        Ok(())
    }

    /// Records a violation, lets the ban engine decide, and journals both.
    /// Journal failures are logged; the in-memory ban still applies.
    fn route_violation(
        &self,
        fingerprint: &Fingerprint,
        result: &ValidationResult,
        pack_id: Uuid,
        now: Timestamp,
    ) -> PackError {
        let kind = result
            .violation_kind()
            .unwrap_or(ViolationKind::PackManipulation);
        let details = result.describe();
        let violation =
            SecurityViolation::with_default_severity(kind, fingerprint.clone(), now, details.clone());

        let violation_record = StateRecord::Violation(violation.clone());
        self.bans.add_violation(violation);
        let ban_record = StateRecord::Ban {
            fingerprint: fingerprint.clone(),
            status: self.bans.is_banned(fingerprint),
        };
        // Logged inside; the in-memory ban stands either way.
        let _ = self.persist(&[violation_record, ban_record]);

        PackError::from_violation(kind, pack_id, details)
    }

    fn audit_open(&self, fingerprint: &Fingerprint, pack: &Pack, now: Timestamp) {
        self.audit.record(
            fingerprint.clone(),
            now,
            AuditEvent::PackOpened {
                pack_id: pack.id,
                pack_type: pack.pack_type,
                best_rarity: pack.best_rarity,
                holo_count: pack.holo_count(),
                degraded: fingerprint.is_degraded(),
            },
        );
    }
}

impl std::fmt::Debug for PackService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackService")
            .field("assembler", &self.assembler)
            .field("journal", &self.journal)
            .field("identities", &self.identities.read().len())
            .finish_non_exhaustive()
    }
}
