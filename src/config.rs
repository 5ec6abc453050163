//! Runtime configuration for the posting core

use bigdecimal::BigDecimal;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::types::{LedgerError, LedgerResult};

/// Which parent accounts are recomputed after a posting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationScope {
    /// Only the ancestor chains of the touched leaves
    #[default]
    Ancestors,
    /// Every parent account of the company
    Company,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Maximum accepted difference between debits and credits
    #[serde(default = "default_tolerance")]
    pub balance_tolerance: BigDecimal,
    /// Attempts for a balance-affecting commit before a conflict surfaces
    #[serde(default = "default_attempts")]
    pub max_commit_attempts: u32,
    /// Attempts for reserving a document number before a conflict surfaces
    #[serde(default = "default_attempts")]
    pub max_allocation_attempts: u32,
    /// Zero-fill width for new document types
    #[serde(default = "default_padding")]
    pub default_padding: usize,
    #[serde(default)]
    pub aggregation_scope: AggregationScope,
}

fn default_tolerance() -> BigDecimal {
    BigDecimal::new(1.into(), 2)
}

fn default_attempts() -> u32 {
    10
}

fn default_padding() -> usize {
    5
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            balance_tolerance: default_tolerance(),
            max_commit_attempts: default_attempts(),
            max_allocation_attempts: default_attempts(),
            default_padding: default_padding(),
            aggregation_scope: AggregationScope::default(),
        }
    }
}

impl LedgerConfig {
    /// Load from an optional `ledger.*` file and `LEDGER__*` environment variables
    pub fn load() -> LedgerResult<Self> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .add_source(File::with_name("ledger").required(false))
            .add_source(Environment::with_prefix("LEDGER").separator("__"))
            .build()?;

        let loaded: Self = config.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Reject values the core cannot work with
    pub fn validate(&self) -> LedgerResult<()> {
        if self.balance_tolerance < BigDecimal::from(0) {
            return Err(LedgerError::Config(
                "balance_tolerance cannot be negative".to_string(),
            ));
        }
        if self.max_commit_attempts == 0 || self.max_allocation_attempts == 0 {
            return Err(LedgerError::Config(
                "retry attempts must be at least 1".to_string(),
            ));
        }
        if self.default_padding == 0 || self.default_padding > 18 {
            return Err(LedgerError::Config(
                "default_padding must be between 1 and 18".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LedgerConfig::default();
        assert_eq!(config.balance_tolerance, "0.01".parse::<BigDecimal>().unwrap());
        assert_eq!(config.max_commit_attempts, 10);
        assert_eq!(config.default_padding, 5);
        assert_eq!(config.aggregation_scope, AggregationScope::Ancestors);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_document_uses_defaults() {
        let config: LedgerConfig =
            serde_json::from_str(r#"{"aggregation_scope": "company", "default_padding": 6}"#)
                .unwrap();
        assert_eq!(config.aggregation_scope, AggregationScope::Company);
        assert_eq!(config.default_padding, 6);
        assert_eq!(config.max_allocation_attempts, 10);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = LedgerConfig {
            max_commit_attempts: 0,
            ..LedgerConfig::default()
        };
        assert!(matches!(config.validate(), Err(LedgerError::Config(_))));
    }
}
