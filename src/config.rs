//! Settings loader for the settlement node
//!
//! Layered configuration: defaults, then an optional `escrow.toml`,
//! then `ESCROW_*` environment variables. Component config structs stay
//! with their components; this module only aggregates and loads them.

use crate::{
    EscrowResult, dispute::DisputeConfig, error::EscrowError, funding::FundingConfig,
    ledger::LedgerConfig, reconciler::ReconcilerConfig, verifier::VerifierConfig,
};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

/// Aggregated settings for one settlement node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    pub ledger: LedgerConfig,
    pub verifier: VerifierConfig,
    pub funding: FundingConfig,
    pub reconciler: ReconcilerConfig,
    pub dispute: DisputeConfig,
    /// Hex-encoded platform signing key; generated fresh when absent
    pub platform_key_hex: Option<String>,
}

impl NodeSettings {
    /// Load settings from `escrow.toml` (optional) and the environment.
    ///
    /// Environment variables use a double underscore as the section
    /// separator, e.g. `ESCROW_VERIFIER__MIN_CONFIRMATIONS=6`.
    pub fn load() -> EscrowResult<Self> {
        Self::load_from("escrow")
    }

    pub fn load_from(file_stem: &str) -> EscrowResult<Self> {
        let config = Config::builder()
            .add_source(File::with_name(file_stem).required(false))
            .add_source(Environment::with_prefix("ESCROW").separator("__"))
            .build()
            .map_err(|e| EscrowError::config(format!("failed to read settings: {e}")))?;
        config
            .try_deserialize()
            .map_err(|e| EscrowError::config(format!("invalid settings: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_any_source() {
        let settings = NodeSettings::load_from("does-not-exist").unwrap();
        assert_eq!(settings.verifier.min_confirmations, 3);
        assert_eq!(settings.ledger.fee_bps, 100);
        assert_eq!(settings.dispute.admin, "0xadmin");
        assert!(settings.platform_key_hex.is_none());
    }

    #[test]
    fn test_settings_roundtrip_through_serde() {
        let mut settings = NodeSettings::default();
        settings.verifier.min_confirmations = 6;
        settings.ledger.fee_bps = 250;

        let json = serde_json::to_string(&settings).unwrap();
        let back: NodeSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(back.verifier.min_confirmations, 6);
        assert_eq!(back.ledger.fee_bps, 250);
    }
}
