//! # Service Configuration
//!
//! One TOML file configures the whole engine. The economy sections
//! (`[thresholds]`, `[rates]`, `[catalog]`) are parsed by
//! [`EconomyConfig`]; this module adds the service sections:
//!
//! ```toml
//! [rate_limits.standard_pack]
//! window_secs = 60
//! max_count = 10
//!
//! [ban]
//! threshold_count = 3
//! threshold_window_secs = 86400
//!
//! [entropy]
//! duplicate_window_secs = 600
//! server_secret_hex = "00112233..."
//!
//! [state]
//! journal_path = "data/state.journal"
//!
//! [audit]
//! journal_path = "data/audit.jsonl"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use daddeck_economy::EconomyConfig;
use daddeck_security::{AuditJournalConfig, BanPolicy, RateLimitPolicy, ServerSecret};

use crate::error::{PackError, PackResult};

/// The `[entropy]` section.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntropyConfig {
    /// How long a pack id counts as recently seen.
    pub duplicate_window_secs: u64,
    /// 32-byte server secret, hex. Without it a fresh secret is minted and
    /// packs issued before a restart can no longer be verified.
    pub server_secret_hex: Option<String>,
    /// Seeds the server RNG. Tests and simulations only.
    pub rng_seed: Option<u64>,
}

impl Default for EntropyConfig {
    fn default() -> Self {
        Self {
            duplicate_window_secs: 10 * 60,
            server_secret_hex: None,
            rng_seed: None,
        }
    }
}

impl EntropyConfig {
    /// Duplicate window as a duration.
    #[must_use]
    pub const fn duplicate_window(&self) -> Duration {
        Duration::from_secs(self.duplicate_window_secs)
    }

    /// Resolves the server secret, minting one from `rng` if none is set.
    ///
    /// # Errors
    ///
    /// Returns [`PackError::Config`] for malformed hex.
    pub fn server_secret<R: Rng + ?Sized>(&self, rng: &mut R) -> PackResult<ServerSecret> {
        match &self.server_secret_hex {
            Some(hex_str) => Ok(ServerSecret::from_hex(hex_str)?),
            None => {
                tracing::warn!("No server secret configured, minting an ephemeral one");
                Ok(ServerSecret::generate(rng))
            }
        }
    }
}

/// The `[state]` section.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// State journal file. In-memory only when unset.
    pub journal_path: Option<PathBuf>,
}

/// The `[audit]` section.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// JSON-lines audit file. In-memory only when unset.
    pub journal_path: Option<PathBuf>,
    /// Writer thread tuning.
    #[serde(flatten)]
    pub writer: AuditJournalConfig,
}

/// Full engine configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Rates, thresholds and catalog. Parsed from the same document.
    #[serde(skip)]
    pub economy: EconomyConfig,
    /// Per-class open limits.
    #[serde(default)]
    pub rate_limits: RateLimitPolicy,
    /// Threshold ban policy.
    #[serde(default)]
    pub ban: BanPolicy,
    /// Entropy and duplicate detection.
    #[serde(default)]
    pub entropy: EntropyConfig,
    /// Durable state.
    #[serde(default)]
    pub state: StateConfig,
    /// Audit trail.
    #[serde(default)]
    pub audit: AuditConfig,
}

impl ServiceConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`PackError::Config`] for malformed TOML or invalid values.
    pub fn from_toml_str(source: &str) -> PackResult<Self> {
        let mut config: Self =
            toml::from_str(source).map_err(|e| PackError::Config(e.to_string()))?;
        config.economy = EconomyConfig::from_toml_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a TOML file.
    ///
    /// # Errors
    ///
    /// See [`ServiceConfig::from_toml_str`].
    pub fn from_file(path: impl AsRef<Path>) -> PackResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| PackError::Config(format!("failed to read {}: {e}", path.display())))?;
        let config = Self::from_toml_str(&source)?;
        tracing::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Checks the service sections.
    ///
    /// # Errors
    ///
    /// Returns [`PackError::Config`] on the first bad value.
    pub fn validate(&self) -> PackResult<()> {
        self.economy.validate()?;

        let limits = &self.rate_limits;
        for (name, rule) in [
            ("standard_pack", limits.standard_pack),
            ("premium_pack", limits.premium_pack),
            ("batch_pack", limits.batch_pack),
        ] {
            if rule.max_count == 0 || rule.window_secs == 0 {
                return Err(PackError::Config(format!(
                    "rate_limits.{name} needs a non-zero window and count"
                )));
            }
        }

        if self.ban.threshold_count == 0 || self.ban.threshold_window_secs == 0 {
            return Err(PackError::Config(
                "ban threshold needs a non-zero count and window".to_string(),
            ));
        }

        if self.entropy.duplicate_window_secs == 0 {
            return Err(PackError::Config(
                "entropy.duplicate_window_secs must be non-zero".to_string(),
            ));
        }
        if let Some(hex_str) = &self.entropy.server_secret_hex {
            ServerSecret::from_hex(hex_str)?;
        }
        Ok(())
    }
}
