//! # Ban Engine
//!
//! Escalates security violations into bans.
//!
//! ## Escalation
//!
//! ```text
//!   Clean ──(any violation)──► Flagged ──(trigger)──► Banned
//!                                                     (terminal)
//! ```
//!
//! Two triggers, evaluated right after a violation is appended and under
//! the same lock:
//!
//! 1. **Immediate**: a duplicate or manipulated pack at `Critical`.
//! 2. **Threshold**: `threshold_count` violations of `Medium` or worse whose
//!    timestamps fall inside the rolling window ending at the newest one.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use daddeck_shared::constants::MILLIS_PER_SECOND;
use daddeck_shared::{Fingerprint, Timestamp};

use crate::audit::{AuditEvent, AuditLog};

/// How bad a violation is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Severity {
    /// Informational.
    Low = 0,
    /// Counts toward the threshold ban.
    Medium = 1,
    /// Serious.
    High = 2,
    /// May ban on its own.
    Critical = 3,
}

impl Severity {
    /// Decodes the `repr(u8)` value.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Low),
            1 => Some(Self::Medium),
            2 => Some(Self::High),
            3 => Some(Self::Critical),
            _ => None,
        }
    }
}

/// What went wrong.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ViolationKind {
    /// Entropy record does not hash or was not issued by this server.
    EntropyMismatch = 0,
    /// Pack contents disagree with its entropy or the slot policy.
    PackManipulation = 1,
    /// Pack id replayed by the same identity.
    DuplicateDetection = 2,
}

impl ViolationKind {
    /// Severity used when the detector has no better information.
    #[must_use]
    pub const fn default_severity(self) -> Severity {
        match self {
            Self::EntropyMismatch | Self::PackManipulation => Severity::High,
            Self::DuplicateDetection => Severity::Critical,
        }
    }

    /// Decodes the `repr(u8)` value.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::EntropyMismatch),
            1 => Some(Self::PackManipulation),
            2 => Some(Self::DuplicateDetection),
            _ => None,
        }
    }

    /// Snake-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EntropyMismatch => "entropy_mismatch",
            Self::PackManipulation => "pack_manipulation",
            Self::DuplicateDetection => "duplicate_detection",
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded violation. Never deleted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityViolation {
    /// Violation id.
    pub id: Uuid,
    /// Category.
    pub kind: ViolationKind,
    /// Severity.
    pub severity: Severity,
    /// When it happened.
    pub timestamp: Timestamp,
    /// Offending identity.
    pub fingerprint: Fingerprint,
    /// Human-readable detail.
    pub details: String,
}

impl SecurityViolation {
    /// Creates a violation with a fresh id.
    #[must_use]
    pub fn new(
        kind: ViolationKind,
        severity: Severity,
        fingerprint: Fingerprint,
        timestamp: Timestamp,
        details: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            severity,
            timestamp,
            fingerprint,
            details: details.into(),
        }
    }

    /// Creates a violation at the kind's default severity.
    #[must_use]
    pub fn with_default_severity(
        kind: ViolationKind,
        fingerprint: Fingerprint,
        timestamp: Timestamp,
        details: impl Into<String>,
    ) -> Self {
        Self::new(kind, kind.default_severity(), fingerprint, timestamp, details)
    }
}

/// Position on the escalation ladder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Standing {
    /// No violations.
    Clean,
    /// Violations on record, not banned.
    Flagged,
    /// Banned.
    Banned,
}

/// Ban state for one identity.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanStatus {
    /// Whether opens are refused.
    pub is_banned: bool,
    /// Why, once banned.
    pub reason: Option<String>,
    /// Every violation recorded against the identity.
    pub violation_ids: Vec<Uuid>,
    /// When the ban was applied.
    pub banned_at: Option<Timestamp>,
}

impl BanStatus {
    /// Escalation state implied by this status.
    #[must_use]
    pub fn standing(&self) -> Standing {
        if self.is_banned {
            Standing::Banned
        } else if self.violation_ids.is_empty() {
            Standing::Clean
        } else {
            Standing::Flagged
        }
    }
}

/// Threshold ban configuration (`[ban]` in the balance file).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BanPolicy {
    /// Violations of `Medium` or worse needed inside the window.
    pub threshold_count: u32,
    /// Rolling window length in seconds.
    pub threshold_window_secs: u64,
}

impl BanPolicy {
    /// The rolling window.
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.threshold_window_secs)
    }
}

impl Default for BanPolicy {
    fn default() -> Self {
        Self {
            threshold_count: 3,
            threshold_window_secs: 24 * 60 * 60,
        }
    }
}

/// Outcome of [`BanEngine::add_violation`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BanDecision {
    /// Recorded; identity is flagged but not banned.
    Recorded,
    /// This violation caused a ban.
    Banned {
        /// Ban reason.
        reason: String,
    },
    /// Recorded against an identity that was already banned.
    AlreadyBanned,
}

#[derive(Default)]
struct BanState {
    statuses: HashMap<Fingerprint, BanStatus>,
    violations: HashMap<Fingerprint, Vec<SecurityViolation>>,
}

/// Escalation engine. One lock covers append and evaluation.
pub struct BanEngine {
    policy: BanPolicy,
    state: Mutex<BanState>,
    audit: Arc<AuditLog>,
}

impl BanEngine {
    /// Creates an engine that reports to `audit`.
    #[must_use]
    pub fn new(policy: BanPolicy, audit: Arc<AuditLog>) -> Self {
        Self {
            policy,
            state: Mutex::new(BanState::default()),
            audit,
        }
    }

    /// Active policy.
    #[must_use]
    pub const fn policy(&self) -> &BanPolicy {
        &self.policy
    }

    /// Current status; the default (clean) status for unknown identities.
    #[must_use]
    pub fn is_banned(&self, fingerprint: &Fingerprint) -> BanStatus {
        self.state
            .lock()
            .statuses
            .get(fingerprint)
            .cloned()
            .unwrap_or_default()
    }

    /// Escalation state for an identity.
    #[must_use]
    pub fn standing(&self, fingerprint: &Fingerprint) -> Standing {
        self.is_banned(fingerprint).standing()
    }

    /// Violations on record for an identity, oldest first.
    #[must_use]
    pub fn violations(&self, fingerprint: &Fingerprint) -> Vec<SecurityViolation> {
        self.state
            .lock()
            .violations
            .get(fingerprint)
            .cloned()
            .unwrap_or_default()
    }

    /// Appends a violation and evaluates both ban triggers.
    pub fn add_violation(&self, violation: SecurityViolation) -> BanDecision {
        let fingerprint = violation.fingerprint.clone();
        let now = violation.timestamp;

        let mut state = self.state.lock();

        self.audit.record(
            fingerprint.clone(),
            now,
            AuditEvent::Violation {
                violation_id: violation.id,
                kind: violation.kind,
                severity: violation.severity,
                details: violation.details.clone(),
            },
        );
        tracing::warn!(
            "Security violation {} ({:?}) for {}: {}",
            violation.kind,
            violation.severity,
            fingerprint,
            violation.details
        );

        let immediate = Self::immediate_trigger(&violation);

        let history = state.violations.entry(fingerprint.clone()).or_default();
        history.push(violation);
        let threshold = self.threshold_trigger(history, now);
        let violation_ids: Vec<Uuid> = history.iter().map(|v| v.id).collect();

        let status = state.statuses.entry(fingerprint.clone()).or_default();
        status.violation_ids = violation_ids;

        if status.is_banned {
            return BanDecision::AlreadyBanned;
        }

        let Some(reason) = immediate.or(threshold) else {
            return BanDecision::Recorded;
        };

        status.is_banned = true;
        status.reason = Some(reason.clone());
        status.banned_at = Some(now);

        self.audit.record(
            fingerprint.clone(),
            now,
            AuditEvent::BanApplied {
                reason: reason.clone(),
                violation_ids: status.violation_ids.clone(),
            },
        );
        tracing::error!("Banned {}: {}", fingerprint, reason);

        BanDecision::Banned { reason }
    }

    /// Reloads a persisted status (startup only).
    pub fn restore_status(&self, fingerprint: Fingerprint, status: BanStatus) {
        self.state.lock().statuses.insert(fingerprint, status);
    }

    /// Reloads a persisted violation (startup only). Ignores repeats by id.
    pub fn restore_violation(&self, violation: SecurityViolation) {
        let mut state = self.state.lock();
        let history = state
            .violations
            .entry(violation.fingerprint.clone())
            .or_default();
        if !history.iter().any(|v| v.id == violation.id) {
            history.push(violation);
            history.sort_by_key(|v| v.timestamp);
        }
    }

    /// All known statuses.
    #[must_use]
    pub fn statuses(&self) -> Vec<(Fingerprint, BanStatus)> {
        self.state
            .lock()
            .statuses
            .iter()
            .map(|(fp, status)| (fp.clone(), status.clone()))
            .collect()
    }

    /// All violations across identities.
    #[must_use]
    pub fn all_violations(&self) -> Vec<SecurityViolation> {
        self.state
            .lock()
            .violations
            .values()
            .flat_map(|v| v.iter().cloned())
            .collect()
    }

    fn immediate_trigger(violation: &SecurityViolation) -> Option<String> {
        let triggers = match violation.kind {
            ViolationKind::DuplicateDetection | ViolationKind::PackManipulation => {
                violation.severity == Severity::Critical
            }
            ViolationKind::EntropyMismatch => false,
        };
        triggers.then(|| {
            format!(
                "immediate: {} at {:?}",
                violation.kind, violation.severity
            )
        })
    }

    fn threshold_trigger(&self, history: &[SecurityViolation], now: Timestamp) -> Option<String> {
        let window_start = now.saturating_sub(self.policy.window());
        let count = history
            .iter()
            .filter(|v| v.severity >= Severity::Medium)
            .filter(|v| v.timestamp >= window_start && v.timestamp <= now)
            .count();

        let needed = usize::try_from(self.policy.threshold_count).unwrap_or(usize::MAX);
        (needed > 0 && count >= needed).then(|| {
            format!(
                "threshold: {count} violations of medium or worse within {}s",
                self.policy.window().as_millis() / u128::from(MILLIS_PER_SECOND)
            )
        })
    }
}

impl fmt::Debug for BanEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BanEngine")
            .field("policy", &self.policy)
            .field("identities", &state.statuses.len())
            .finish_non_exhaustive()
    }
}
