//! # Audit Log
//!
//! Append-only record of everything the pack pipeline decided.
//!
//! Records are kept in memory for queries and, when a journal is attached,
//! handed to a background writer as JSON lines. Recording never fails and
//! never blocks on disk.

mod journal;

pub use journal::{AuditJournal, AuditJournalConfig, JournalStats};

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use daddeck_economy::{PackType, Rarity};
use daddeck_shared::{Fingerprint, Timestamp};

use crate::ban::{Severity, ViolationKind};
use crate::error::SecurityResult;
use crate::rate_limit::ActionClass;

/// Why an open was refused before any pack was built.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum BlockReason {
    /// Over the rate limit for a class.
    RateLimited {
        /// Class that was exhausted.
        class: ActionClass,
    },
    /// Identity is banned.
    Banned,
}

/// Something worth remembering.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum AuditEvent {
    /// A pack was opened and handed out.
    PackOpened {
        /// Pack id.
        pack_id: Uuid,
        /// Product line.
        pack_type: PackType,
        /// Best card in the pack.
        best_rarity: Rarity,
        /// Holo cards in the pack.
        holo_count: usize,
        /// Opened without a real fingerprint.
        degraded: bool,
    },
    /// An open was refused.
    OpenBlocked {
        /// Why.
        block: BlockReason,
    },
    /// A security violation was recorded.
    Violation {
        /// Violation id.
        violation_id: Uuid,
        /// Category.
        kind: ViolationKind,
        /// Severity.
        severity: Severity,
        /// Detail text.
        details: String,
    },
    /// A ban was applied.
    BanApplied {
        /// Ban reason.
        reason: String,
        /// Violations on record at ban time.
        violation_ids: Vec<Uuid>,
    },
}

/// One audit line.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Monotonic sequence number.
    pub seq: u64,
    /// When it happened.
    pub timestamp: Timestamp,
    /// Identity involved.
    pub fingerprint: Fingerprint,
    /// What happened.
    pub event: AuditEvent,
}

/// Violation breakdown.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ViolationStats {
    /// Violations recorded.
    pub total: u64,
    /// Count per kind.
    pub by_kind: BTreeMap<ViolationKind, u64>,
    /// Count per severity.
    pub by_severity: BTreeMap<Severity, u64>,
    /// Bans applied.
    pub bans: u64,
}

/// Volume for one day.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DayVolume {
    /// All records.
    pub records: u64,
    /// Packs opened.
    pub packs_opened: u64,
    /// Opens refused.
    pub opens_blocked: u64,
    /// Violations recorded.
    pub violations: u64,
}

/// Log volume overall and per UTC day.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogStats {
    /// All records.
    pub total_records: u64,
    /// Keyed by days since the Unix epoch.
    pub per_day: BTreeMap<u64, DayVolume>,
}

/// In-memory audit log with an optional journal.
#[derive(Debug, Default)]
pub struct AuditLog {
    records: RwLock<Vec<AuditRecord>>,
    next_seq: AtomicU64,
    journal: Option<AuditJournal>,
}

impl AuditLog {
    /// Memory-only log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Log that also journals to `path`, preloaded with what is already there.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the journal cannot be read or opened.
    pub fn open(path: impl AsRef<Path>, config: AuditJournalConfig) -> SecurityResult<Self> {
        let path = path.as_ref();
        let existing = AuditJournal::read_records(path)?;
        let next_seq = existing.last().map_or(0, |r| r.seq + 1);
        if !existing.is_empty() {
            tracing::info!(
                "Loaded {} audit records from {}",
                existing.len(),
                path.display()
            );
        }

        Ok(Self {
            records: RwLock::new(existing),
            next_seq: AtomicU64::new(next_seq),
            journal: Some(AuditJournal::open(path, config)?),
        })
    }

    /// Appends a record. Fire-and-forget.
    pub fn record(&self, fingerprint: Fingerprint, timestamp: Timestamp, event: AuditEvent) {
        let mut records = self.records.write();
        let record = AuditRecord {
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            timestamp,
            fingerprint,
            event,
        };
        if let Some(journal) = &self.journal {
            journal.append(&record);
        }
        records.push(record);
    }

    /// Copy of every record, oldest first.
    #[must_use]
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.read().clone()
    }

    /// Records for one identity.
    #[must_use]
    pub fn records_for(&self, fingerprint: &Fingerprint) -> Vec<AuditRecord> {
        self.records
            .read()
            .iter()
            .filter(|r| &r.fingerprint == fingerprint)
            .cloned()
            .collect()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// True if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Attached journal, if any.
    #[must_use]
    pub const fn journal(&self) -> Option<&AuditJournal> {
        self.journal.as_ref()
    }

    /// Waits until the journal has written everything recorded so far.
    pub fn flush(&self) {
        if let Some(journal) = &self.journal {
            journal.flush();
        }
    }

    /// Violation counts by kind and severity, plus bans.
    #[must_use]
    pub fn violation_stats(&self) -> ViolationStats {
        let records = self.records.read();
        let mut stats = ViolationStats::default();
        for record in records.iter() {
            match &record.event {
                AuditEvent::Violation { kind, severity, .. } => {
                    stats.total += 1;
                    *stats.by_kind.entry(*kind).or_default() += 1;
                    *stats.by_severity.entry(*severity).or_default() += 1;
                }
                AuditEvent::BanApplied { .. } => stats.bans += 1,
                AuditEvent::PackOpened { .. } | AuditEvent::OpenBlocked { .. } => {}
            }
        }
        stats
    }

    /// Identities with the most violations, most first. Ties by fingerprint.
    #[must_use]
    pub fn top_offenders(&self, n: usize) -> Vec<(Fingerprint, u64)> {
        let records = self.records.read();
        let mut counts: HashMap<&Fingerprint, u64> = HashMap::new();
        for record in records.iter() {
            if matches!(record.event, AuditEvent::Violation { .. }) {
                *counts.entry(&record.fingerprint).or_default() += 1;
            }
        }

        let mut ranked: Vec<(Fingerprint, u64)> = counts
            .into_iter()
            .map(|(fp, count)| (fp.clone(), count))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(n);
        ranked
    }

    /// Record volume per day.
    #[must_use]
    pub fn log_stats(&self) -> LogStats {
        let records = self.records.read();
        let mut stats = LogStats::default();
        for record in records.iter() {
            stats.total_records += 1;
            let day = stats.per_day.entry(record.timestamp.day_index()).or_default();
            day.records += 1;
            match record.event {
                AuditEvent::PackOpened { .. } => day.packs_opened += 1,
                AuditEvent::OpenBlocked { .. } => day.opens_blocked += 1,
                AuditEvent::Violation { .. } => day.violations += 1,
                AuditEvent::BanApplied { .. } => {}
            }
        }
        stats
    }
}
