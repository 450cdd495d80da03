//! # Pack Simulator
//!
//! Command-line tool to check drop rates and the open pipeline against a
//! balance file.

use std::sync::Arc;
use std::time::Duration;

use daddeck::{InMemoryCollection, PackService, ServiceConfig};
use daddeck_economy::{PackAssembler, PackType, PityCounter, Rarity};
use daddeck_shared::{Fingerprint, ManualClock, Timestamp};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use tracing_subscriber::EnvFilter;

const DEFAULT_PACKS: u64 = 100_000;
const DEFAULT_SEED: u64 = 0xDAD_DECC;

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    println!("╔══════════════════════════════════════════════════════════════════╗");
    println!("║         DADDECK PACK SIMULATOR                                   ║");
    println!("╚══════════════════════════════════════════════════════════════════╝");
    println!();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help") {
        println!("Usage: pack_simulator [config.toml] [options]");
        println!();
        println!("Options:");
        println!("  --packs <n>      Packs per simulated identity (default {DEFAULT_PACKS})");
        println!("  --seed <n>       RNG seed (default {DEFAULT_SEED})");
        println!("  --service <n>    Also push <n> identities through the open pipeline");
        return;
    }

    let flag = |name: &str| -> Option<u64> {
        args.iter()
            .position(|a| a == name)
            .and_then(|i| args.get(i + 1))
            .and_then(|s| s.parse().ok())
    };
    let packs = flag("--packs").unwrap_or(DEFAULT_PACKS);
    let seed = flag("--seed").unwrap_or(DEFAULT_SEED);
    let identities = flag("--service");

    let config = match args.get(1).filter(|a| !a.starts_with("--")) {
        Some(path) => match ServiceConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                println!("Error: {e}");
                return;
            }
        },
        None => {
            println!("No config given, using built-in launch balance");
            ServiceConfig::default()
        }
    };

    let assembler = match config.economy.build_assembler() {
        Ok(assembler) => assembler,
        Err(e) => {
            println!("Error: {e}");
            return;
        }
    };

    for pack_type in PackType::ALL {
        report_rates(&assembler, pack_type, packs, seed);
    }

    if let Some(identities) = identities {
        run_service(config, identities, packs.min(500), seed);
    }
}

fn report_rates(assembler: &PackAssembler, pack_type: PackType, packs: u64, seed: u64) {
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    let stats = match assembler.run_statistics(pack_type, &PityCounter::default(), packs, &mut rng) {
        Ok(stats) => stats,
        Err(e) => {
            println!("Error: {e}");
            return;
        }
    };

    let base = assembler.table().base(pack_type);
    println!("┌─ {:<8} PACKS ({} opened) ─────────────────────────────────────", pack_type.as_str().to_uppercase(), stats.packs);
    println!("│ {:<10} {:>10} {:>12} {:>14}", "Rarity", "Base", "Card share", "Packs with ≥");
    for rarity in Rarity::ALL {
        println!(
            "│ {:<10} {:>9.3}% {:>11.3}% {:>13.3}%",
            rarity.as_str(),
            base.get(rarity) * 100.0,
            stats.card_share(rarity) * 100.0,
            stats.packs_with_at_least(rarity) * 100.0
        );
    }
    println!("│");
    println!("│ Holo rate:          {:.2}% (target {:.2}%)", stats.holo_rate() * 100.0, 100.0 / 6.0);
    println!("│ Hard-pity packs:    {}", stats.forced_packs);
    println!("└──────────────────────────────────────────────────────────────────");
    println!();
}

/// Opens packs for `identities` dads through the full pipeline on a manual
/// clock, one open every 10 seconds, and submits each pack for collection.
/// Every tenth dad submits each pack twice and should end up banned.
fn run_service(mut config: ServiceConfig, identities: u64, packs: u64, seed: u64) {
    config.entropy.rng_seed = Some(seed);

    let clock = Arc::new(ManualClock::new(Timestamp::from_secs(1_700_000_000)));
    let collection = Arc::new(InMemoryCollection::new());
    let service = match PackService::from_config(&config, clock.clone(), collection.clone()) {
        Ok(service) => service,
        Err(e) => {
            println!("Error: {e}");
            return;
        }
    };

    let dads: Vec<Fingerprint> = (0..identities).map(|i| Fingerprint::new(format!("sim-dad-{i}"))).collect();
    let mut refused = 0u64;
    for _ in 0..packs {
        for (i, dad) in dads.iter().enumerate() {
            let pack = match service.open_pack(dad, PackType::Standard) {
                Ok(pack) => pack,
                Err(_) => {
                    refused += 1;
                    continue;
                }
            };
            if service.submit_pack(dad, &pack).is_err() {
                refused += 1;
            }
            if i % 10 == 9 && service.submit_pack(dad, &pack).is_err() {
                refused += 1;
            }
        }
        clock.advance(Duration::from_secs(10));
    }

    let log = service.audit().log_stats();
    let violations = service.audit().violation_stats();
    println!("┌─ SERVICE RUN ({identities} identities) ──────────────────────────────────");
    println!("│ Packs stored:       {}", collection.len());
    println!("│ Calls refused:      {refused}");
    println!("│ Audit records:      {}", log.total_records);
    for (day, volume) in &log.per_day {
        println!(
            "│   day {day}: {} opened, {} blocked, {} violations",
            volume.packs_opened, volume.opens_blocked, volume.violations
        );
    }
    println!("│ Violations:         {}", violations.total);
    println!("│ Bans:               {}", violations.bans);
    for (fingerprint, count) in service.audit().top_offenders(5) {
        println!("│   {fingerprint}: {count}");
    }
    println!("└──────────────────────────────────────────────────────────────────");
}
