//! Client configuration, loadable from TOML.
//!
//! ```toml
//! proposal_timeout_ms = 5000
//! update_timeout_ms = 5000
//!
//! [[ledgers]]
//! backend = 0
//! chain_id = 1337
//! egoistic = true
//! ```

use crate::{
    channel::LedgerBackendId,
    encoding::types::U256,
    multi::MultiFunder,
};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{0} must not be zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// How long the proposer waits for the answer to a channel proposal and
    /// the initial signatures.
    pub proposal_timeout_ms: u64,
    pub update_timeout_ms: u64,
    pub funding_timeout_ms: u64,
    /// How long to wait for an adjudicator event after sending a
    /// transaction.
    pub event_timeout_ms: u64,
    /// How long an intermediary waits for the matching proposal of the other
    /// side of a virtual channel.
    pub virtual_match_timeout_ms: u64,
    pub resubscribe_delay_ms: u64,
    pub ledgers: Vec<LedgerConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LedgerConfig {
    pub backend: u32,
    pub chain_id: u64,
    /// Deposit on this ledger only after all other ledgers are funded.
    #[serde(default)]
    pub egoistic: bool,
}

impl LedgerConfig {
    pub fn ledger(&self) -> LedgerBackendId {
        LedgerBackendId {
            backend: self.backend,
            ledger: U256::from(self.chain_id),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            proposal_timeout_ms: 10_000,
            update_timeout_ms: 10_000,
            funding_timeout_ms: 60_000,
            event_timeout_ms: 30_000,
            virtual_match_timeout_ms: 10_000,
            resubscribe_delay_ms: 1_000,
            ledgers: Vec::new(),
        }
    }
}

impl ClientConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let timeouts = [
            ("proposal_timeout_ms", self.proposal_timeout_ms),
            ("update_timeout_ms", self.update_timeout_ms),
            ("funding_timeout_ms", self.funding_timeout_ms),
            ("event_timeout_ms", self.event_timeout_ms),
            ("virtual_match_timeout_ms", self.virtual_match_timeout_ms),
        ];
        match timeouts.iter().find(|(_, v)| *v == 0) {
            Some((name, _)) => Err(ConfigError::Zero(*name)),
            None => Ok(()),
        }
    }

    pub fn proposal_timeout(&self) -> Duration {
        Duration::from_millis(self.proposal_timeout_ms)
    }

    pub fn update_timeout(&self) -> Duration {
        Duration::from_millis(self.update_timeout_ms)
    }

    pub fn funding_timeout(&self) -> Duration {
        Duration::from_millis(self.funding_timeout_ms)
    }

    pub fn event_timeout(&self) -> Duration {
        Duration::from_millis(self.event_timeout_ms)
    }

    pub fn virtual_match_timeout(&self) -> Duration {
        Duration::from_millis(self.virtual_match_timeout_ms)
    }

    pub fn resubscribe_delay(&self) -> Duration {
        Duration::from_millis(self.resubscribe_delay_ms)
    }

    /// Marks the configured egoistic ledgers in `funder`.
    pub fn apply_egoistic(&self, funder: &mut MultiFunder) {
        for ledger in &self.ledgers {
            funder.set_egoistic(ledger.ledger(), ledger.egoistic);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_fields() {
        let cfg = ClientConfig::from_toml_str("update_timeout_ms = 250").unwrap();
        assert_eq!(cfg.update_timeout(), Duration::from_millis(250));
        assert_eq!(cfg.proposal_timeout(), ClientConfig::default().proposal_timeout());
        assert!(cfg.ledgers.is_empty());
    }

    #[test]
    fn ledgers_are_parsed() {
        let cfg = ClientConfig::from_toml_str(
            r#"
            resubscribe_delay_ms = 20

            [[ledgers]]
            backend = 0
            chain_id = 1337

            [[ledgers]]
            backend = 1
            chain_id = 5
            egoistic = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.resubscribe_delay(), Duration::from_millis(20));
        assert_eq!(cfg.ledgers.len(), 2);
        assert!(!cfg.ledgers[0].egoistic);
        assert_eq!(
            cfg.ledgers[1].ledger(),
            LedgerBackendId {
                backend: 1,
                ledger: U256::from(5u64)
            }
        );

        let mut funder = MultiFunder::new();
        cfg.apply_egoistic(&mut funder);
        assert!(funder.is_egoistic(&cfg.ledgers[1].ledger()));
        assert!(!funder.is_egoistic(&cfg.ledgers[0].ledger()));
    }

    #[test]
    fn invalid_configs_are_rejected() {
        assert!(matches!(
            ClientConfig::from_toml_str("update_timeout = 5"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            ClientConfig::from_toml_str("event_timeout_ms = 0"),
            Err(ConfigError::Zero("event_timeout_ms"))
        ));
    }
}
