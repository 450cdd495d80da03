//! Statistical properties of pity and pack assembly.

use std::sync::Arc;

use daddeck_economy::{
    PackAssembler, PackType, PityCounter, PityThresholds, PityTracker, Rarity, RarityTable,
    RarityThresholds, StaticCatalog,
};
use daddeck_shared::Timestamp;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn scenario_assembler() -> PackAssembler {
    let thresholds = PityThresholds {
        rare: RarityThresholds::new(Rarity::Rare, 15, 30, 2.0).unwrap(),
        ..PityThresholds::default()
    };
    PackAssembler::new(
        RarityTable::default(),
        PityTracker::try_new(thresholds).unwrap(),
        Arc::new(StaticCatalog::default()),
    )
}

#[test]
fn test_rare_hard_pity_guarantees_rare_in_every_adjusted_slot() {
    let assembler = scenario_assembler();
    let mut rng = ChaCha8Rng::seed_from_u64(0xDAD);

    for packs_since_rare in [30, 31, 100] {
        let counter = PityCounter {
            packs_since_rare,
            ..PityCounter::default()
        };
        for _ in 0..10_000 {
            let rolled = assembler
                .assemble(PackType::Standard, &counter, &mut rng)
                .unwrap();
            assert!(rolled.best_rarity >= Rarity::Rare);
            assert_eq!(rolled.forced_tier, Some(Rarity::Rare));
            for card in &rolled.cards[3..] {
                assert!(card.rarity >= Rarity::Rare);
            }
        }
    }
}

#[test]
fn test_one_before_hard_pity_is_boosted_but_not_guaranteed() {
    let assembler = scenario_assembler();
    let counter = PityCounter {
        packs_since_rare: 29,
        ..PityCounter::default()
    };

    let base = assembler.table().base(PackType::Standard).get(Rarity::Rare);
    let adjusted = assembler.adjusted_weights(PackType::Standard, &counter);
    assert!(adjusted.get(Rarity::Rare) > base * 5.0);
    assert!(adjusted.get(Rarity::Rare) < 1.0);
    assert_eq!(assembler.tracker().guaranteed_tier(&counter), None);

    let mut rng = ChaCha8Rng::seed_from_u64(29);
    let mut below_rare_in_slot_four = 0;
    for _ in 0..10_000 {
        let rolled = assembler
            .assemble(PackType::Standard, &counter, &mut rng)
            .unwrap();
        assert_eq!(rolled.forced_tier, None);
        if rolled.cards[3].rarity < Rarity::Rare {
            below_rare_in_slot_four += 1;
        }
    }
    assert!(below_rare_in_slot_four > 0);
}

#[test]
fn test_adjusted_rare_weight_never_drops_as_pity_grows() {
    let assembler = scenario_assembler();
    let mut previous = 0.0;
    for packs_since_rare in 0..=30 {
        let counter = PityCounter {
            packs_since_rare,
            ..PityCounter::default()
        };
        let weight = assembler
            .adjusted_weights(PackType::Standard, &counter)
            .get(Rarity::Rare);
        assert!(
            weight >= previous,
            "rare weight fell from {previous} to {weight} at {packs_since_rare}"
        );
        previous = weight;
    }
}

#[test]
fn test_adjusted_weights_always_sum_to_one() {
    let assembler = scenario_assembler();
    for pack_type in PackType::ALL {
        for rare in (0..=35).step_by(5) {
            for epic in (0..=45).step_by(5) {
                for legendary in (0..=90).step_by(15) {
                    for mythic in (0..=210).step_by(30) {
                        let counter = PityCounter {
                            packs_since_rare: rare,
                            packs_since_epic: epic,
                            packs_since_legendary: legendary,
                            packs_since_mythic: mythic,
                            last_updated: Timestamp::EPOCH,
                        };
                        let total = assembler.adjusted_weights(pack_type, &counter).total();
                        assert!(
                            (total - 1.0).abs() < 1e-9,
                            "{pack_type} {counter:?} sums to {total}"
                        );
                    }
                }
            }
        }
    }
}

#[test]
fn test_counters_never_pass_hard_pity_over_a_long_session() {
    let assembler = scenario_assembler();
    let tracker = *assembler.tracker();
    let thresholds = *tracker.thresholds();
    let mut rng = ChaCha8Rng::seed_from_u64(1234);
    let mut counter = PityCounter::default();

    for i in 0..20_000u64 {
        let rolled = assembler
            .assemble(PackType::Standard, &counter, &mut rng)
            .unwrap();
        counter = tracker.update(
            &counter,
            rolled.cards.iter().map(|c| c.rarity),
            Timestamp::from_secs(i),
        );
        for tier in Rarity::PITY_TIERS {
            let hard = thresholds.for_tier(tier).unwrap().hard_pity();
            assert!(
                counter.packs_since(tier) <= hard,
                "{tier:?} counter {} passed hard pity {hard}",
                counter.packs_since(tier)
            );
        }
    }
}
