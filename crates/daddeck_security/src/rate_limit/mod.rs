//! # Rate Limiting
//!
//! Sliding-window counters per `(fingerprint, action class)`.
//!
//! A window stores the timestamps of admitted actions and forgets the ones
//! older than its length the next time it is looked at. `check` never
//! consumes capacity; `record` is called only after an action was admitted.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use daddeck_economy::PackType;
use daddeck_shared::{Fingerprint, Timestamp};

/// What is being limited.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionClass {
    /// Single standard pack.
    StandardPack,
    /// Single premium pack.
    PremiumPack,
    /// Batch of packs.
    BatchPack,
}

impl ActionClass {
    /// All classes.
    pub const ALL: [Self; 3] = [Self::StandardPack, Self::PremiumPack, Self::BatchPack];

    /// Class for a single open of `pack_type`.
    #[must_use]
    pub const fn for_pack(pack_type: PackType) -> Self {
        match pack_type {
            PackType::Standard => Self::StandardPack,
            PackType::Premium => Self::PremiumPack,
        }
    }

    /// Snake-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StandardPack => "standard_pack",
            Self::PremiumPack => "premium_pack",
            Self::BatchPack => "batch_pack",
        }
    }
}

impl fmt::Display for ActionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Limit for one class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Window length in seconds.
    pub window_secs: u64,
    /// Admissions allowed per window.
    pub max_count: u32,
}

impl RateLimitRule {
    /// Creates a rule.
    #[must_use]
    pub const fn new(window_secs: u64, max_count: u32) -> Self {
        Self {
            window_secs,
            max_count,
        }
    }

    /// Window length.
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Limits for every class (`[rate_limits]` in the balance file).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitPolicy {
    /// Standard packs.
    pub standard_pack: RateLimitRule,
    /// Premium packs.
    pub premium_pack: RateLimitRule,
    /// Batches.
    pub batch_pack: RateLimitRule,
}

impl RateLimitPolicy {
    /// Rule for a class.
    #[must_use]
    pub const fn rule(&self, class: ActionClass) -> RateLimitRule {
        match class {
            ActionClass::StandardPack => self.standard_pack,
            ActionClass::PremiumPack => self.premium_pack,
            ActionClass::BatchPack => self.batch_pack,
        }
    }
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            standard_pack: RateLimitRule::new(60, 10),
            premium_pack: RateLimitRule::new(60, 5),
            batch_pack: RateLimitRule::new(300, 3),
        }
    }
}

/// Snapshot of one window, returned by every limiter call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    /// Admissions allowed per window.
    pub limit: u32,
    /// Admissions left right now.
    pub remaining: u32,
    /// When the oldest admission leaves the window.
    pub reset_at: Timestamp,
    /// True when `remaining` is zero.
    pub is_blocked: bool,
}

impl RateLimitStatus {
    /// How long a blocked caller should wait. Zero when not blocked.
    #[must_use]
    pub fn retry_after(&self, now: Timestamp) -> Duration {
        if self.is_blocked {
            self.reset_at.duration_since(now)
        } else {
            Duration::ZERO
        }
    }
}

/// Admission timestamps for one `(fingerprint, class)`.
#[derive(Clone, Debug)]
pub struct RateLimitWindow {
    timestamps: VecDeque<Timestamp>,
    window: Duration,
    max_count: u32,
}

impl RateLimitWindow {
    /// Empty window for a rule.
    #[must_use]
    pub fn new(rule: RateLimitRule) -> Self {
        Self {
            timestamps: VecDeque::new(),
            window: rule.window(),
            max_count: rule.max_count,
        }
    }

    /// Drops timestamps that have left the window.
    pub fn prune(&mut self, now: Timestamp) {
        let cutoff = now.saturating_sub(self.window);
        while self.timestamps.front().is_some_and(|&t| t <= cutoff) {
            self.timestamps.pop_front();
        }
    }

    /// Status at `now`. Call after [`RateLimitWindow::prune`].
    #[must_use]
    pub fn status(&self, now: Timestamp) -> RateLimitStatus {
        let used = u32::try_from(self.timestamps.len()).unwrap_or(u32::MAX);
        let remaining = self.max_count.saturating_sub(used);
        let reset_at = self
            .timestamps
            .front()
            .map_or(now, |&oldest| oldest.saturating_add(self.window));
        RateLimitStatus {
            limit: self.max_count,
            remaining,
            reset_at,
            is_blocked: remaining == 0,
        }
    }

    /// Appends an admission.
    pub fn push(&mut self, now: Timestamp) {
        self.timestamps.push_back(now);
    }

    /// Timestamps currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// True if nothing is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// Sliding-window rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    policy: RateLimitPolicy,
    windows: Mutex<HashMap<(Fingerprint, ActionClass), RateLimitWindow>>,
}

impl RateLimiter {
    /// Creates a limiter.
    #[must_use]
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            policy,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Active policy.
    #[must_use]
    pub const fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Prunes and reports. Consumes nothing.
    pub fn check(&self, fingerprint: &Fingerprint, class: ActionClass, now: Timestamp) -> RateLimitStatus {
        let mut windows = self.windows.lock();
        match windows.get_mut(&(fingerprint.clone(), class)) {
            Some(window) => {
                window.prune(now);
                window.status(now)
            }
            None => RateLimitWindow::new(self.policy.rule(class)).status(now),
        }
    }

    /// Records an admitted action and returns the status after it.
    pub fn record(&self, fingerprint: &Fingerprint, class: ActionClass, now: Timestamp) -> RateLimitStatus {
        let mut windows = self.windows.lock();
        let window = windows
            .entry((fingerprint.clone(), class))
            .or_insert_with(|| RateLimitWindow::new(self.policy.rule(class)));
        window.prune(now);
        window.push(now);
        window.status(now)
    }

    /// Check and record in one step. `Err` carries the blocking status.
    ///
    /// # Errors
    ///
    /// Returns the current status when the window is full.
    pub fn try_acquire(
        &self,
        fingerprint: &Fingerprint,
        class: ActionClass,
        now: Timestamp,
    ) -> Result<RateLimitStatus, RateLimitStatus> {
        let mut windows = self.windows.lock();
        let window = windows
            .entry((fingerprint.clone(), class))
            .or_insert_with(|| RateLimitWindow::new(self.policy.rule(class)));
        window.prune(now);
        let status = window.status(now);
        if status.is_blocked {
            tracing::debug!("Rate limit hit: {} on {}", fingerprint, class);
            return Err(status);
        }
        window.push(now);
        Ok(window.status(now))
    }

    /// Drops every empty window. Returns how many were dropped.
    pub fn sweep(&self, now: Timestamp) -> usize {
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, window| {
            window.prune(now);
            !window.is_empty()
        });
        before - windows.len()
    }
}
