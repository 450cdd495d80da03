//! # Balance Configuration
//!
//! Rates, pity thresholds and the card list, loaded from TOML.
//!
//! ```toml
//! [thresholds.rare]
//! soft_pity = 15
//! hard_pity = 30
//! soft_pity_multiplier = 2.0
//!
//! [rates.standard]
//! common = 0.60
//! uncommon = 0.25
//! rare = 0.10
//! epic = 0.04
//! legendary = 0.009
//! mythic = 0.001
//!
//! [catalog]
//! common = ["lawn-mower-dad", "cargo-shorts"]
//! ```
//!
//! Every section is optional; missing sections fall back to the launch
//! defaults. Unknown keys are ignored so the service-level file can carry
//! its own sections alongside these.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::catalog::{CardCatalog, StaticCatalog};
use crate::error::{EconomyError, EconomyResult};
use crate::pack::PackAssembler;
use crate::pity::{PityThresholds, PityTracker};
use crate::rarity::RarityTable;

/// The `[catalog]` section: card ids per rarity.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CatalogConfig {
    /// Cards keyed by rarity.
    pub cards: StaticCatalog,
}

/// Economy half of the balance file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EconomyConfig {
    /// Pity thresholds per tier.
    #[serde(default)]
    pub thresholds: PityThresholds,
    /// Base rates per pack type.
    #[serde(default)]
    pub rates: RarityTable,
    /// Card list.
    #[serde(default)]
    pub catalog: CatalogConfig,
}

impl EconomyConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::InvalidConfig`] for malformed TOML, bad weights
    /// or an incomplete catalog, and [`EconomyError::InvalidThresholds`] for
    /// bad pity thresholds.
    pub fn from_toml_str(source: &str) -> EconomyResult<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| EconomyError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a TOML file.
    ///
    /// # Errors
    ///
    /// See [`EconomyConfig::from_toml_str`]; unreadable files are
    /// [`EconomyError::InvalidConfig`].
    pub fn from_file(path: impl AsRef<Path>) -> EconomyResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            EconomyError::InvalidConfig(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&source)
    }

    /// Checks everything serde cannot.
    ///
    /// # Errors
    ///
    /// See [`EconomyConfig::from_toml_str`].
    pub fn validate(&self) -> EconomyResult<()> {
        self.thresholds.validate()?;

        let missing = self.catalog.cards.missing_rarities();
        if !missing.is_empty() {
            let names: Vec<&str> = missing.iter().map(|r| r.as_str()).collect();
            return Err(EconomyError::InvalidConfig(format!(
                "catalog has no cards for: {}",
                names.join(", ")
            )));
        }
        Ok(())
    }

    /// Builds a pack assembler from this configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::InvalidThresholds`] or
    /// [`EconomyError::CatalogExhausted`].
    pub fn build_assembler(&self) -> EconomyResult<PackAssembler> {
        let tracker = PityTracker::try_new(self.thresholds)?;
        let assembler = PackAssembler::new(
            self.rates.clone(),
            tracker,
            Arc::new(self.catalog.cards.clone()),
        );
        assembler.check_catalog()?;
        Ok(assembler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::PackType;
    use crate::rarity::Rarity;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = EconomyConfig::from_toml_str("").unwrap();
        assert_eq!(config, EconomyConfig::default());
        assert!(config.build_assembler().is_ok());
    }

    #[test]
    fn test_partial_sections_merge_with_defaults() {
        let source = r#"
            [thresholds.rare]
            soft_pity = 5
            hard_pity = 10
            soft_pity_multiplier = 3.0

            [rates.premium]
            common = 0.40
            uncommon = 0.30
            rare = 0.20
            epic = 0.07
            legendary = 0.02
            mythic = 0.01
        "#;
        let config = EconomyConfig::from_toml_str(source).unwrap();
        assert_eq!(config.thresholds.rare.hard_pity(), 10);
        assert_eq!(config.thresholds.epic, PityThresholds::default().epic);
        assert!((config.rates.base(PackType::Premium).get(Rarity::Mythic) - 0.01).abs() < 1e-12);
        assert_eq!(config.rates.standard, RarityTable::default().standard);
    }

    #[test]
    fn test_rejects_weights_not_summing_to_one() {
        let source = r#"
            [rates.standard]
            common = 0.90
            uncommon = 0.25
            rare = 0.10
            epic = 0.04
            legendary = 0.009
            mythic = 0.001
        "#;
        let err = EconomyConfig::from_toml_str(source).unwrap_err();
        assert!(matches!(err, EconomyError::InvalidConfig(_)));
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let source = r#"
            [thresholds.mythic]
            soft_pity = 200
            hard_pity = 100
            soft_pity_multiplier = 5.0
        "#;
        assert!(EconomyConfig::from_toml_str(source).is_err());
    }

    #[test]
    fn test_rejects_incomplete_catalog() {
        let source = r#"
            [catalog]
            common = ["a"]
            uncommon = ["b"]
        "#;
        let err = EconomyConfig::from_toml_str(source).unwrap_err();
        match err {
            EconomyError::InvalidConfig(msg) => assert!(msg.contains("rare")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_custom_catalog_flows_into_assembler() {
        let source = r#"
            [catalog]
            common = ["c"]
            uncommon = ["u"]
            rare = ["r"]
            epic = ["e"]
            legendary = ["l"]
            mythic = ["m"]
        "#;
        let assembler = EconomyConfig::from_toml_str(source)
            .unwrap()
            .build_assembler()
            .unwrap();
        assert_eq!(assembler.catalog().cards_of_rarity(Rarity::Common), ["c".to_string()]);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let path = std::env::temp_dir().join("daddeck_missing_config_does_not_exist.toml");
        let err = EconomyConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, EconomyError::InvalidConfig(_)));
    }
}
