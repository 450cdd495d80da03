//! Integration test: validation failures flowing into bans and the audit log.

use std::sync::Arc;
use std::time::Duration;

use daddeck_economy::{
    PackAssembler, PackHeader, PackType, PityCounter, PityThresholds, PityTracker, RarityTable,
    StaticCatalog,
};
use daddeck_security::{
    ActionClass, AuditLog, BanDecision, BanEngine, BanPolicy, EntropyValidator, RateLimitPolicy,
    RateLimitRule, RateLimiter, SecurityViolation, ServerSecret, Severity, Standing,
    ViolationKind,
};
use daddeck_shared::{Clock, Fingerprint, ManualClock, Timestamp};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use uuid::Uuid;

struct Harness {
    clock: ManualClock,
    audit: Arc<AuditLog>,
    bans: BanEngine,
    validator: EntropyValidator,
    assembler: PackAssembler,
    rng: ChaCha20Rng,
}

impl Harness {
    fn new() -> Self {
        let audit = Arc::new(AuditLog::new());
        Self {
            clock: ManualClock::new(Timestamp::from_secs(1_700_000_000)),
            bans: BanEngine::new(BanPolicy::default(), Arc::clone(&audit)),
            audit,
            validator: EntropyValidator::new(
                ServerSecret::new(&[0x5a; 32]),
                EntropyValidator::DEFAULT_DUPLICATE_WINDOW,
            ),
            assembler: PackAssembler::new(
                RarityTable::default(),
                PityTracker::new(PityThresholds::default()),
                Arc::new(StaticCatalog::default()),
            ),
            rng: ChaCha20Rng::seed_from_u64(99),
        }
    }

    fn open_pack(&mut self) -> daddeck_economy::Pack {
        let id = Uuid::new_v4();
        let header = PackHeader {
            id,
            pack_type: PackType::Standard,
            opened_at: self.clock.now(),
            entropy: self.validator.create(&id, None, &mut self.rng),
        };
        self.assembler
            .assemble_pack(&header, &PityCounter::default())
            .unwrap()
    }

    fn submit(&self, fp: &Fingerprint, pack: &daddeck_economy::Pack) -> Option<BanDecision> {
        let now = self.clock.now();
        let result = self.validator.validate(pack, &pack.entropy, fp, now, None);
        let kind = result.violation_kind()?;
        let violation = SecurityViolation::with_default_severity(kind, fp.clone(), now, result.describe());
        Some(self.bans.add_violation(violation))
    }
}

#[test]
fn test_replayed_submission_bans_and_is_audited() {
    let mut h = Harness::new();
    let fp = Fingerprint::new("replayer");
    let pack = h.open_pack();

    assert_eq!(h.submit(&fp, &pack), None);
    h.clock.advance(Duration::from_secs(5));

    let decision = h.submit(&fp, &pack).unwrap();
    assert!(matches!(decision, BanDecision::Banned { .. }));
    assert_eq!(h.bans.standing(&fp), Standing::Banned);

    let stats = h.audit.violation_stats();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.bans, 1);
    assert_eq!(stats.by_kind[&ViolationKind::DuplicateDetection], 1);
    assert_eq!(h.audit.top_offenders(5), vec![(fp, 1)]);
}

#[test]
fn test_tampered_hashes_escalate_by_threshold() {
    let mut h = Harness::new();
    let fp = Fingerprint::new("tamperer");

    for round in 0..3 {
        let mut pack = h.open_pack();
        pack.entropy.combined_hash[0] ^= 0xff;
        let decision = h.submit(&fp, &pack).unwrap();
        if round < 2 {
            assert_eq!(decision, BanDecision::Recorded);
            assert_eq!(h.bans.standing(&fp), Standing::Flagged);
        } else {
            assert!(matches!(decision, BanDecision::Banned { .. }));
        }
        h.clock.advance(Duration::from_secs(60 * 60));
    }

    let status = h.bans.is_banned(&fp);
    assert!(status.is_banned);
    assert_eq!(status.violation_ids.len(), 3);
}

#[test]
fn test_medium_violations_a_day_apart_never_ban() {
    let h = Harness::new();
    let fp = Fingerprint::new("unlucky");
    for _ in 0..6 {
        let v = SecurityViolation::new(
            ViolationKind::EntropyMismatch,
            Severity::Medium,
            fp.clone(),
            h.clock.now(),
            "clock skew",
        );
        assert_eq!(h.bans.add_violation(v), BanDecision::Recorded);
        h.clock.advance(Duration::from_secs(13 * 60 * 60));
    }
    assert_eq!(h.bans.standing(&fp), Standing::Flagged);
}

#[test]
fn test_rate_limit_window_with_manual_clock() {
    let clock = ManualClock::new(Timestamp::from_secs(0));
    let limiter = RateLimiter::new(RateLimitPolicy {
        standard_pack: RateLimitRule::new(60, 5),
        ..RateLimitPolicy::default()
    });
    let fp = Fingerprint::new("clicker");

    for _ in 0..5 {
        assert!(limiter.try_acquire(&fp, ActionClass::StandardPack, clock.now()).is_ok());
        clock.advance(Duration::from_secs(1));
    }
    let blocked = limiter
        .try_acquire(&fp, ActionClass::StandardPack, clock.now())
        .unwrap_err();
    assert_eq!(blocked.retry_after(clock.now()), Duration::from_secs(55));

    clock.set(Timestamp::from_secs(60));
    assert!(limiter.try_acquire(&fp, ActionClass::StandardPack, clock.now()).is_ok());
}
