//! Integration test: state surviving a restart.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use daddeck::{
    EntropyConfig, InMemoryCollection, OpenRequest, PackError, PackService, ServiceConfig,
    StateJournal, StateRecord,
};
use daddeck_economy::{CardCatalog, CardInstance, HoloType, PackType, PityCounter, Rarity};
use daddeck_security::AuditEvent;
use daddeck_shared::{Fingerprint, ManualClock, Timestamp};
use uuid::Uuid;

struct TempFiles {
    state: PathBuf,
    audit: PathBuf,
}

impl TempFiles {
    fn new(name: &str) -> Self {
        let id = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir();
        Self {
            state: dir.join(format!("test_{name}_{id}.journal")),
            audit: dir.join(format!("test_{name}_{id}.jsonl")),
        }
    }

    fn config(&self) -> ServiceConfig {
        let mut config = ServiceConfig {
            entropy: EntropyConfig {
                rng_seed: Some(7),
                server_secret_hex: Some("c3".repeat(32)),
                ..EntropyConfig::default()
            },
            ..ServiceConfig::default()
        };
        config.state.journal_path = Some(self.state.clone());
        config.audit.journal_path = Some(self.audit.clone());
        config
    }
}

impl Drop for TempFiles {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.state);
        let _ = std::fs::remove_file(&self.audit);
    }
}

fn start(files: &TempFiles, clock: &Arc<ManualClock>) -> PackService {
    PackService::from_config(
        &files.config(),
        clock.clone(),
        Arc::new(InMemoryCollection::new()),
    )
    .unwrap()
}

#[test]
fn test_pity_and_bans_survive_restart() {
    let files = TempFiles::new("restart");
    let clock = Arc::new(ManualClock::new(Timestamp::from_secs(1_700_000_000)));
    let alice = Fingerprint::new("alice");
    let mallory = Fingerprint::new("mallory");

    let (alice_counter, audit_len) = {
        let service = start(&files, &clock);
        for _ in 0..3 {
            service.open_pack(&alice, PackType::Standard).unwrap();
            clock.advance(Duration::from_secs(1));
        }
        let pack = service.open_pack(&mallory, PackType::Standard).unwrap();
        service.submit_pack(&mallory, &pack).unwrap();
        assert!(matches!(
            service.submit_pack(&mallory, &pack),
            Err(PackError::DuplicateDetected { .. })
        ));
        service.flush().unwrap();
        (service.pity_counter(&alice), service.audit().len())
    };

    let service = start(&files, &clock);
    assert_eq!(service.pity_counter(&alice), alice_counter);
    assert_eq!(service.pity_counter(&alice).last_updated, Timestamp::from_secs(1_700_000_002));

    let status = service.ban_status(&mallory);
    assert!(status.is_banned);
    assert_eq!(service.bans().violations(&mallory).len(), 1);
    assert!(matches!(
        service.open_pack(&mallory, PackType::Standard),
        Err(PackError::Banned { .. })
    ));

    // Audit trail reloaded, then extended by the blocked open.
    assert_eq!(service.audit().len(), audit_len + 1);
    let seqs: Vec<u64> = service.audit().records().iter().map(|r| r.seq).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));

    // Pity for alice and mallory, four deliveries, one violation, one ban.
    assert_eq!(service.compact_journal().unwrap(), 8);
}

#[test]
fn test_hard_pity_restored_from_journal_is_honoured() {
    let files = TempFiles::new("hard_pity");
    let dad = Fingerprint::new("unlucky-dad");
    {
        let (journal, recovered) = StateJournal::open(&files.state).unwrap();
        assert!(recovered.is_empty());
        journal
            .append(&StateRecord::Pity {
                fingerprint: dad.clone(),
                counter: PityCounter {
                    packs_since_legendary: 80,
                    packs_since_mythic: 80,
                    ..PityCounter::default()
                },
            })
            .unwrap();
        journal.sync().unwrap();
    }

    let clock = Arc::new(ManualClock::new(Timestamp::from_secs(1_700_000_000)));
    let service = start(&files, &clock);
    assert_eq!(service.pity_counter(&dad).packs_since_legendary, 80);

    let pack = service.open_pack(&dad, PackType::Standard).unwrap();
    assert!(pack.best_rarity >= Rarity::Legendary);

    let after = service.pity_counter(&dad);
    assert_eq!(after.packs_since_legendary, 0);
    assert_eq!(after.packs_since_epic, 0);
    assert_eq!(after.packs_since_rare, 0);

    match service.audit().records().pop().unwrap().event {
        AuditEvent::PackOpened { best_rarity, .. } => assert_eq!(best_rarity, pack.best_rarity),
        other => panic!("unexpected audit event {other:?}"),
    }
}

#[test]
fn test_compaction_keeps_latest_state() {
    let files = TempFiles::new("compact");
    let clock = Arc::new(ManualClock::new(Timestamp::from_secs(1_700_000_000)));
    let dad = Fingerprint::new("regular-dad");

    let counter = {
        let service = start(&files, &clock);
        for _ in 0..8 {
            service.open_pack(&dad, PackType::Standard).unwrap();
            clock.advance(Duration::from_secs(10));
        }
        let journal = service.journal().unwrap();
        // Pity plus delivery per open.
        assert_eq!(journal.next_lsn(), 16);
        assert_eq!(service.compact_journal().unwrap(), 9);
        service.open_pack(&dad, PackType::Standard).unwrap();
        service.flush().unwrap();
        service.pity_counter(&dad)
    };

    let (_, recovered) = StateJournal::open(&files.state).unwrap();
    assert_eq!(recovered.records, 11);
    assert_eq!(recovered.deliveries.len(), 9);
    assert_eq!(recovered.pity.get(&dad), Some(&counter));
    assert_eq!(recovered.discarded_bytes, 0);
}

#[test]
fn test_delivered_packs_survive_restart() {
    let files = TempFiles::new("deliveries");
    let clock = Arc::new(ManualClock::new(Timestamp::from_secs(1_700_000_000)));
    let dad = Fingerprint::new("returning-dad");
    let stranger = Fingerprint::new("stranger-dad");
    let id = Uuid::new_v4();

    let (first, stored, mut forged) = {
        let service = start(&files, &clock);
        let first = service
            .open(OpenRequest::new(dad.clone(), PackType::Premium).with_pack_id(id))
            .unwrap();
        let stored = service.open_pack(&dad, PackType::Standard).unwrap();
        service.submit_pack(&dad, &stored).unwrap();
        let forged = service.open_pack(&dad, PackType::Standard).unwrap();
        (first, stored, forged)
    };

    clock.advance(Duration::from_secs(3600));
    let service = start(&files, &clock);
    let counter = service.pity_counter(&dad);

    // Same id, same pack, nothing charged.
    let again = service
        .open(
            OpenRequest::new(dad.clone(), PackType::Premium)
                .with_pack_id(id)
                .with_client_seed([1; 32]),
        )
        .unwrap();
    assert_eq!(again, first);
    assert_eq!(service.pity_counter(&dad), counter);
    assert_eq!(
        service.open(OpenRequest::new(stranger, PackType::Premium).with_pack_id(id)),
        Err(PackError::DuplicateDetected { pack_id: id })
    );

    // Still checked card for card.
    let mythic = service.assembler().catalog().cards_of_rarity(Rarity::Mythic)[0].clone();
    let last = forged.cards.len() - 1;
    forged.cards[last] = CardInstance {
        card_id: mythic,
        rarity: Rarity::Mythic,
        is_holo: false,
        holo_type: HoloType::None,
    };
    forged.best_rarity = Rarity::Mythic;
    let err = service.submit_pack(&dad, &forged).unwrap_err();
    assert!(matches!(err, PackError::PackManipulation(_)), "{err:?}");
    assert!(!service.ban_status(&dad).is_banned);

    // Stored before the restart, so a duplicate now.
    assert_eq!(
        service.submit_pack(&dad, &stored),
        Err(PackError::DuplicateDetected { pack_id: stored.id })
    );
    assert!(service.ban_status(&dad).is_banned);
}
