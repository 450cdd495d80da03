//! Integration test: the open and submit pipelines end to end.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use daddeck::{
    CollectionSink, EntropyConfig, InMemoryCollection, OpenRequest, PackError, PackService,
    ServiceConfig, StorageError,
};
use daddeck_economy::{CardCatalog, CardInstance, HoloType, Pack, PackType, Rarity};
use daddeck_security::{
    ActionClass, AuditEvent, BlockReason, FingerprintProvider, SecurityError, SecurityResult,
    Standing,
};
use daddeck_shared::{Clock, Fingerprint, ManualClock, Timestamp};
use uuid::Uuid;

const START: u64 = 1_700_000_000;

fn config() -> ServiceConfig {
    ServiceConfig {
        entropy: EntropyConfig {
            rng_seed: Some(42),
            server_secret_hex: Some("5a".repeat(32)),
            ..EntropyConfig::default()
        },
        ..ServiceConfig::default()
    }
}

fn harness_with(sink: Arc<dyn CollectionSink>) -> (PackService, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(Timestamp::from_secs(START)));
    let service = PackService::from_config(&config(), clock.clone(), sink).unwrap();
    (service, clock)
}

fn harness() -> (PackService, Arc<ManualClock>, Arc<InMemoryCollection>) {
    let collection = Arc::new(InMemoryCollection::new());
    let (service, clock) = harness_with(collection.clone());
    (service, clock, collection)
}

fn last_event(service: &PackService) -> AuditEvent {
    service.audit().records().pop().unwrap().event
}

#[test]
fn test_premium_limit_blocks_sixth_open_until_window_passes() {
    let (service, clock, _) = harness();
    let dad = Fingerprint::new("eager-dad");

    for _ in 0..5 {
        service.open_pack(&dad, PackType::Premium).unwrap();
        clock.advance(Duration::from_secs(1));
    }
    let counter = service.pity_counter(&dad);

    let err = service.open_pack(&dad, PackType::Premium).unwrap_err();
    let PackError::RateLimited { class, status } = &err else {
        panic!("expected rate limit, got {err:?}");
    };
    assert_eq!(*class, ActionClass::PremiumPack);
    assert_eq!(status.remaining, 0);
    assert!(status.retry_after(clock.now()) > Duration::ZERO);
    assert!(err.is_blocked());

    // Refusal changes nothing but the audit trail.
    assert_eq!(service.pity_counter(&dad), counter);
    assert_eq!(
        last_event(&service),
        AuditEvent::OpenBlocked {
            block: BlockReason::RateLimited {
                class: ActionClass::PremiumPack
            }
        }
    );

    // Standard packs have their own window.
    service.open_pack(&dad, PackType::Standard).unwrap();

    clock.advance(Duration::from_secs(60));
    service.open_pack(&dad, PackType::Premium).unwrap();
}

#[test]
fn test_duplicate_submission_bans_immediately() {
    let (service, clock, collection) = harness();
    let dad = Fingerprint::new("replay-dad");

    let pack = service.open_pack(&dad, PackType::Standard).unwrap();
    service.submit_pack(&dad, &pack).unwrap();
    assert_eq!(collection.packs_for(&dad), vec![pack.clone()]);

    clock.advance(Duration::from_secs(5));
    assert_eq!(
        service.submit_pack(&dad, &pack),
        Err(PackError::DuplicateDetected { pack_id: pack.id })
    );

    let status = service.ban_status(&dad);
    assert!(status.is_banned);
    assert!(status.reason.as_deref().unwrap().starts_with("immediate:"));
    assert_eq!(status.violation_ids.len(), 1);
    assert_eq!(collection.len(), 1);

    // Banned identities get nothing, and the refusal is audited.
    let err = service.open_pack(&dad, PackType::Standard).unwrap_err();
    assert!(matches!(err, PackError::Banned { .. }));
    assert_eq!(
        last_event(&service),
        AuditEvent::OpenBlocked {
            block: BlockReason::Banned
        }
    );
    assert!(matches!(
        service.submit_pack(&dad, &pack),
        Err(PackError::Banned { .. })
    ));

    // Other identities are unaffected.
    service
        .open_pack(&Fingerprint::new("honest-dad"), PackType::Standard)
        .unwrap();
}

#[test]
fn test_tampered_entropy_is_rejected_then_escalates() {
    let (service, clock, collection) = harness();
    let dad = Fingerprint::new("tinkering-dad");

    for attempt in 0..3 {
        let mut pack = service.open_pack(&dad, PackType::Standard).unwrap();
        pack.entropy.client_seed[0] ^= 0xff;

        let err = service.submit_pack(&dad, &pack).unwrap_err();
        assert!(matches!(err, PackError::EntropyMismatch(_)), "{err:?}");

        let standing = service.bans().standing(&dad);
        if attempt < 2 {
            assert_eq!(standing, Standing::Flagged);
        } else {
            assert_eq!(standing, Standing::Banned);
        }
        clock.advance(Duration::from_secs(30));
    }

    let reason = service.ban_status(&dad).reason.unwrap();
    assert!(reason.starts_with("threshold:"), "{reason}");
    assert!(collection.is_empty());
}

#[test]
fn test_substituted_card_is_manipulation() {
    let (service, _, collection) = harness();
    let dad = Fingerprint::new("swapping-dad");

    let mut pack = service.open_pack(&dad, PackType::Standard).unwrap();
    let last = pack.cards.len() - 1;
    pack.cards[last].card_id = pack.cards[0].card_id.clone();
    pack.cards[last].rarity = pack.cards[0].rarity;

    let err = service.submit_pack(&dad, &pack).unwrap_err();
    assert!(matches!(err, PackError::PackManipulation(_)), "{err:?}");
    assert!(collection.is_empty());
}

#[test]
fn test_replayed_open_returns_same_pack_without_charging() {
    let (service, _, _) = harness();
    let dad = Fingerprint::new("flaky-network-dad");
    let id = Uuid::new_v4();

    let request = OpenRequest::new(dad.clone(), PackType::Standard).with_pack_id(id);
    let first = service.open(request.clone()).unwrap();
    let second = service.open(request).unwrap();

    assert_eq!(first, second);
    assert_eq!(first.id, id);
    assert_eq!(
        service
            .rate_limit_status(&dad, ActionClass::StandardPack)
            .remaining,
        9
    );
    assert_eq!(service.audit().records_for(&dad).len(), 1);
}

#[test]
fn test_batch_advances_pity_pack_by_pack() {
    let (service, _, _) = harness();
    let dad = Fingerprint::new("bulk-dad");

    let packs = service.open_batch(&dad, PackType::Standard, 10).unwrap();
    assert_eq!(packs.len(), 10);

    // Every pack carries a rare-or-better in its last slot, so the rare
    // counter never moves; epic counts packs since the last epic.
    let counter = service.pity_counter(&dad);
    assert_eq!(counter.packs_since_rare, 0);
    let since_epic = packs
        .iter()
        .rev()
        .take_while(|p| p.best_rarity < daddeck_economy::Rarity::Epic)
        .count();
    assert_eq!(counter.packs_since_epic as usize, since_epic);

    // Batch is charged against its own class only.
    assert_eq!(
        service
            .rate_limit_status(&dad, ActionClass::StandardPack)
            .remaining,
        10
    );
    assert_eq!(
        service.rate_limit_status(&dad, ActionClass::BatchPack).remaining,
        2
    );
}

struct Unfingerprintable;

impl FingerprintProvider for Unfingerprintable {
    fn fingerprint(&self) -> SecurityResult<Fingerprint> {
        Err(SecurityError::FingerprintUnavailable("storage partitioned".into()))
    }
}

#[test]
fn test_unavailable_fingerprint_opens_degraded() {
    let (service, _, _) = harness();

    let (identity, pack) = service
        .open_with_provider(&Unfingerprintable, Some("session-9"), PackType::Standard)
        .unwrap();

    assert!(identity.degraded);
    assert_eq!(identity.fingerprint.as_str(), "degraded:session-9");
    match last_event(&service) {
        AuditEvent::PackOpened {
            pack_id, degraded, ..
        } => {
            assert_eq!(pack_id, pack.id);
            assert!(degraded);
        }
        other => panic!("unexpected audit event {other:?}"),
    }

    // Same session, same identity, same windows.
    let (again, _) = service
        .open_with_provider(&Unfingerprintable, Some("session-9"), PackType::Standard)
        .unwrap();
    assert_eq!(again.fingerprint, identity.fingerprint);
    assert_eq!(
        service
            .rate_limit_status(&identity.fingerprint, ActionClass::StandardPack)
            .remaining,
        8
    );
}

#[derive(Default)]
struct FlakyStore {
    down: AtomicBool,
    inner: InMemoryCollection,
}

impl CollectionSink for FlakyStore {
    fn add_pack_to_collection(&self, fingerprint: &Fingerprint, pack: &Pack) -> Result<(), StorageError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StorageError("collection store offline".into()));
        }
        self.inner.add_pack_to_collection(fingerprint, pack)
    }
}

#[test]
fn test_store_outage_does_not_count_as_duplicate() {
    let store = Arc::new(FlakyStore::default());
    let (service, _) = harness_with(store.clone());
    let dad = Fingerprint::new("patient-dad");

    let pack = service.open_pack(&dad, PackType::Standard).unwrap();

    store.down.store(true, Ordering::SeqCst);
    assert!(matches!(
        service.submit_pack(&dad, &pack),
        Err(PackError::StorageUnavailable(_))
    ));

    store.down.store(false, Ordering::SeqCst);
    service.submit_pack(&dad, &pack).unwrap();

    assert_eq!(store.inner.len(), 1);
    assert_eq!(service.bans().standing(&dad), Standing::Clean);
}

#[test]
fn test_concurrent_opens_respect_the_window() {
    let (service, _, _) = harness();
    let dad = Fingerprint::new("many-tabs-dad");

    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..20)
            .map(|_| scope.spawn(|| service.open_pack(&dad, PackType::Standard)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let opened = results.iter().filter(|r| r.is_ok()).count();
    let limited = results
        .iter()
        .filter(|r| matches!(r, Err(PackError::RateLimited { .. })))
        .count();
    assert_eq!(opened, 10);
    assert_eq!(limited, 10);
    assert_eq!(service.audit().records_for(&dad).len(), 20);
}

/// Opens `count` throwaway packs, moving the clock past the standard window
/// whenever it fills.
fn open_many(service: &PackService, clock: &ManualClock, dad: &Fingerprint, count: usize) {
    for i in 0..count {
        if i % 10 == 0 {
            clock.advance(Duration::from_secs(61));
        }
        service.open_pack(dad, PackType::Standard).unwrap();
    }
}

fn forge_mythic(service: &PackService, pack: &mut Pack) {
    let mythic = service.assembler().catalog().cards_of_rarity(Rarity::Mythic)[0].clone();
    let last = pack.cards.len() - 1;
    pack.cards[last] = CardInstance {
        card_id: mythic,
        rarity: Rarity::Mythic,
        is_holo: false,
        holo_type: HoloType::None,
    };
    pack.best_rarity = Rarity::Mythic;
}

#[test]
fn test_old_pack_id_replays_same_pack_after_many_opens() {
    let (service, clock, _) = harness();
    let dad = Fingerprint::new("retrying-dad");
    let id = Uuid::new_v4();

    let first = service
        .open(OpenRequest::new(dad.clone(), PackType::Standard).with_pack_id(id))
        .unwrap();
    open_many(&service, &clock, &dad, 70);
    let counter = service.pity_counter(&dad);
    let audited = service.audit().len();

    // A different client seed changes nothing for an id already issued.
    let again = service
        .open(
            OpenRequest::new(dad.clone(), PackType::Standard)
                .with_pack_id(id)
                .with_client_seed([7; 32]),
        )
        .unwrap();

    assert_eq!(again, first);
    assert_eq!(service.pity_counter(&dad), counter);
    assert_eq!(service.audit().len(), audited);
}

#[test]
fn test_pack_id_cannot_be_reused_by_another_identity() {
    let (service, _, _) = harness();
    let id = Uuid::new_v4();
    let owner = Fingerprint::new("first-dad");
    let other = Fingerprint::new("second-dad");

    service
        .open(OpenRequest::new(owner, PackType::Premium).with_pack_id(id))
        .unwrap();
    assert_eq!(
        service.open(OpenRequest::new(other.clone(), PackType::Premium).with_pack_id(id)),
        Err(PackError::DuplicateDetected { pack_id: id })
    );
    assert_eq!(service.audit().records_for(&other).len(), 0);
    assert_eq!(service.bans().standing(&other), Standing::Clean);
}

#[test]
fn test_forged_card_in_old_pack_is_manipulation() {
    let (service, clock, collection) = harness();
    let dad = Fingerprint::new("patient-forger-dad");

    let mut pack = service.open_pack(&dad, PackType::Standard).unwrap();
    open_many(&service, &clock, &dad, 70);

    forge_mythic(&service, &mut pack);
    let err = service.submit_pack(&dad, &pack).unwrap_err();
    assert!(matches!(err, PackError::PackManipulation(_)), "{err:?}");
    assert!(collection.is_empty());
    assert_eq!(service.bans().violations(&dad).len(), 1);
}

#[test]
fn test_pack_never_issued_is_manipulation() {
    let (service, _, collection) = harness();
    let dad = Fingerprint::new("inventive-dad");
    let thief = Fingerprint::new("borrowing-dad");

    let pack = service.open_pack(&dad, PackType::Standard).unwrap();
    let err = service.submit_pack(&thief, &pack).unwrap_err();
    assert!(matches!(err, PackError::PackManipulation(_)), "{err:?}");

    let mut invented = pack.clone();
    invented.id = Uuid::new_v4();
    let err = service.submit_pack(&dad, &invented).unwrap_err();
    assert!(matches!(err, PackError::PackManipulation(_)), "{err:?}");
    assert!(collection.is_empty());

    // The real owner can still store the real pack.
    service.submit_pack(&dad, &pack).unwrap();
}

#[test]
fn test_resubmission_after_duplicate_window_is_still_duplicate() {
    let (service, clock, collection) = harness();
    let dad = Fingerprint::new("slow-replay-dad");

    let pack = service.open_pack(&dad, PackType::Standard).unwrap();
    service.submit_pack(&dad, &pack).unwrap();
    assert!(service.delivery(&pack.id).unwrap().submitted_at.is_some());

    clock.advance(Duration::from_secs(11 * 60));
    service.sweep();
    assert_eq!(
        service.submit_pack(&dad, &pack),
        Err(PackError::DuplicateDetected { pack_id: pack.id })
    );
    assert!(service.ban_status(&dad).is_banned);
    assert_eq!(collection.len(), 1);
}
