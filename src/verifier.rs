//! Transaction verifier - checks submitted funding transactions on the ledger
//!
//! Given a transaction reference and the expected shape of the funding,
//! this service confirms on the ledger that the transaction really funds
//! the expected trade for the expected amount between the expected parties,
//! at sufficient inclusion depth. Every mismatch is a verification failure
//! returned to the caller, who owns the retry policy.

use crate::{
    EscrowResult,
    error::EscrowError,
    ledger::LedgerConnection,
    models::LedgerEvent,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Configuration for the transaction verifier
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Minimum inclusion depth before a transaction is treated as final
    pub min_confirmations: u64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self { min_confirmations: 3 }
    }
}

/// What the caller expects the funding transaction to have done
#[derive(Debug, Clone)]
pub struct ExpectedFunding {
    /// `None` when the transaction creates the trade itself
    pub trade_id: Option<u64>,
    pub buyer: String,
    pub seller: String,
    pub amount_wei: u128,
}

/// The funding facts the ledger actually attests to
#[derive(Debug, Clone)]
pub struct VerifiedFunding {
    pub trade_id: u64,
    pub payer: String,
    pub amount_wei: u128,
    pub block_number: u64,
    pub confirmations: u64,
}

/// Main transaction verifier
pub struct TransactionVerifier {
    config: VerifierConfig,
    ledger: Arc<dyn LedgerConnection>,
}

impl TransactionVerifier {
    pub fn new(config: VerifierConfig, ledger: Arc<dyn LedgerConnection>) -> Self {
        Self { config, ledger }
    }

    pub fn min_confirmations(&self) -> u64 {
        self.config.min_confirmations
    }

    /// Verify a funding transaction against the expectation.
    pub async fn verify_funding_tx(
        &self,
        tx_hash: &str,
        expected: &ExpectedFunding,
    ) -> EscrowResult<VerifiedFunding> {
        let receipt = self
            .ledger
            .get_receipt(tx_hash)
            .await?
            .ok_or_else(|| EscrowError::verification(format!("receipt not found for {tx_hash}")))?;

        if !receipt.is_success() {
            return Err(EscrowError::verification(format!(
                "transaction reverted: {}",
                receipt.revert_reason.as_deref().unwrap_or("unknown reason")
            )));
        }

        let head = self.ledger.head_block().await?;
        let confirmations = head.saturating_sub(receipt.block_number);
        if confirmations < self.config.min_confirmations {
            return Err(EscrowError::verification(format!(
                "insufficient confirmations: {confirmations}/{}",
                self.config.min_confirmations
            )));
        }

        // A matching funding event must exist in this exact transaction.
        // Amount comparison is exact-integer, never float.
        let funded = receipt
            .events
            .iter()
            .find_map(|sealed| match &sealed.event {
                LedgerEvent::Funded {
                    trade_id,
                    payer,
                    amount_wei,
                } => Some((*trade_id, payer.clone(), *amount_wei)),
                _ => None,
            })
            .ok_or_else(|| {
                EscrowError::verification(format!("no funding event emitted by {tx_hash}"))
            })?;
        let (trade_id, payer, amount_wei) = funded;

        if let Some(expected_id) = expected.trade_id {
            if trade_id != expected_id {
                return Err(EscrowError::verification(format!(
                    "trade id mismatch: {trade_id} != {expected_id}"
                )));
            }
        }
        if amount_wei != expected.amount_wei {
            return Err(EscrowError::verification(format!(
                "amount mismatch: {amount_wei} != {}",
                expected.amount_wei
            )));
        }
        if payer != expected.buyer {
            return Err(EscrowError::verification(format!(
                "payer mismatch: {payer} != {}",
                expected.buyer
            )));
        }

        // Cross-check the trade record for the parties the event omits.
        let trade = self
            .ledger
            .get_trade(trade_id)
            .await?
            .ok_or_else(|| EscrowError::verification(format!("trade {trade_id} not found")))?;
        if trade.buyer != expected.buyer {
            return Err(EscrowError::verification(format!(
                "buyer mismatch: {} != {}",
                trade.buyer, expected.buyer
            )));
        }
        if trade.seller != expected.seller {
            return Err(EscrowError::verification(format!(
                "seller mismatch: {} != {}",
                trade.seller, expected.seller
            )));
        }

        debug!("Verified funding tx {tx_hash} for trade {trade_id} at depth {confirmations}");
        info!("Funding verified: trade {trade_id}, {amount_wei} wei, {confirmations} confirmations");

        Ok(VerifiedFunding {
            trade_id,
            payer,
            amount_wei,
            block_number: receipt.block_number,
            confirmations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{EscrowLedger, LedgerConfig};

    const ETH: u128 = 1_000_000_000_000_000_000;

    fn expected(amount_wei: u128) -> ExpectedFunding {
        ExpectedFunding {
            trade_id: None,
            buyer: "0xbuyer".to_string(),
            seller: "0xseller".to_string(),
            amount_wei,
        }
    }

    async fn setup() -> (Arc<EscrowLedger>, TransactionVerifier) {
        let ledger = Arc::new(EscrowLedger::new(LedgerConfig::default()));
        ledger.credit("0xbuyer", 10 * ETH).await;
        let verifier =
            TransactionVerifier::new(VerifierConfig::default(), ledger.clone());
        (ledger, verifier)
    }

    #[tokio::test]
    async fn test_verify_happy_path() {
        let (ledger, verifier) = setup().await;
        let tx = ledger
            .create_and_fund("0xbuyer", "0xseller", ETH, "{}")
            .await
            .unwrap();
        ledger.mine_blocks(3).await;

        let verified = verifier.verify_funding_tx(&tx, &expected(ETH)).await.unwrap();
        assert_eq!(verified.amount_wei, ETH);
        assert_eq!(verified.payer, "0xbuyer");
        assert!(verified.confirmations >= 3);
    }

    #[tokio::test]
    async fn test_below_confirmation_threshold_rejected() {
        let (ledger, verifier) = setup().await;
        let tx = ledger
            .create_and_fund("0xbuyer", "0xseller", ETH, "{}")
            .await
            .unwrap();
        // No extra blocks mined: depth is zero.

        let err = verifier.verify_funding_tx(&tx, &expected(ETH)).await.unwrap_err();
        assert!(matches!(err, EscrowError::Verification(_)));
        assert!(err.to_string().contains("insufficient confirmations"));
    }

    #[tokio::test]
    async fn test_amount_mismatch_rejected() {
        let (ledger, verifier) = setup().await;
        let tx = ledger
            .create_and_fund("0xbuyer", "0xseller", ETH / 2, "{}")
            .await
            .unwrap();
        ledger.mine_blocks(3).await;

        let err = verifier.verify_funding_tx(&tx, &expected(ETH)).await.unwrap_err();
        assert!(err.to_string().contains("amount mismatch"));
    }

    #[tokio::test]
    async fn test_wrong_seller_rejected() {
        let (ledger, verifier) = setup().await;
        let tx = ledger
            .create_and_fund("0xbuyer", "0xsomeone_else", ETH, "{}")
            .await
            .unwrap();
        ledger.mine_blocks(3).await;

        let err = verifier.verify_funding_tx(&tx, &expected(ETH)).await.unwrap_err();
        assert!(err.to_string().contains("seller mismatch"));
    }

    #[tokio::test]
    async fn test_reverted_tx_rejected() {
        let (ledger, verifier) = setup().await;
        // Zero amount reverts on the ledger.
        let tx = ledger
            .create_and_fund("0xbuyer", "0xseller", 0, "{}")
            .await
            .unwrap();
        ledger.mine_blocks(3).await;

        let err = verifier.verify_funding_tx(&tx, &expected(ETH)).await.unwrap_err();
        assert!(err.to_string().contains("reverted"));
    }

    #[tokio::test]
    async fn test_unknown_tx_rejected() {
        let (_ledger, verifier) = setup().await;
        let err = verifier
            .verify_funding_tx("0xmissing", &expected(ETH))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("receipt not found"));
    }

    #[tokio::test]
    async fn test_trade_id_expectation_enforced() {
        let (ledger, verifier) = setup().await;
        let tx = ledger
            .create_and_fund("0xbuyer", "0xseller", ETH, "{}")
            .await
            .unwrap();
        ledger.mine_blocks(3).await;

        let mut exp = expected(ETH);
        exp.trade_id = Some(999);
        let err = verifier.verify_funding_tx(&tx, &exp).await.unwrap_err();
        assert!(err.to_string().contains("trade id mismatch"));
    }
}
