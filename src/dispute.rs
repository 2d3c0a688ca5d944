//! Dispute resolver - applies administrative outcomes to disputed trades
//!
//! Arbitration happens off-ledger; this component takes the resulting
//! decision, validates it against the trade, and submits the resolution
//! under the administrator identity. The local record only takes the
//! outcome provisionally: the record closes when the reconciler folds
//! the emitted resolution events back in.

use crate::{
    EscrowResult,
    error::EscrowError,
    ledger::LedgerConnection,
    models::{DisputeOutcome, EscrowRecord, EventCause, RecordState, ResolutionDecision, Trade},
    record_store::RecordStore,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Configuration for the dispute resolver
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisputeConfig {
    /// Administrator identity resolutions are submitted under
    pub admin: String,
}

impl Default for DisputeConfig {
    fn default() -> Self {
        Self {
            admin: "0xadmin".to_string(),
        }
    }
}

/// Main dispute resolver
pub struct DisputeResolver {
    config: DisputeConfig,
    store: Arc<RecordStore>,
    ledger: Arc<dyn LedgerConnection>,
}

impl DisputeResolver {
    pub fn new(
        config: DisputeConfig,
        store: Arc<RecordStore>,
        ledger: Arc<dyn LedgerConnection>,
    ) -> Self {
        Self {
            config,
            store,
            ledger,
        }
    }

    /// Apply an arbitration decision to a disputed escrow.
    pub async fn resolve(&self, decision: &ResolutionDecision) -> EscrowResult<EscrowRecord> {
        let record = self.store.get(decision.escrow_id).await?;
        if record.state != RecordState::Disputed {
            return Err(EscrowError::dispute(format!(
                "escrow {} is {}, not disputed",
                record.id,
                record.state.as_str()
            )));
        }
        let trade_id = record.trade_id.ok_or_else(|| {
            EscrowError::dispute(format!("escrow {} has no linked trade", record.id))
        })?;
        let trade = self
            .ledger
            .get_trade(trade_id)
            .await?
            .ok_or_else(|| EscrowError::not_found(format!("trade {trade_id} not found")))?;

        let (recipient, amount_wei) = Self::payout_terms(decision, &trade)?;

        let tx_hash = self
            .ledger
            .resolve_dispute(
                &self.config.admin,
                trade_id,
                &recipient,
                amount_wei,
                &decision.note,
            )
            .await?;
        let receipt = self
            .ledger
            .get_receipt(&tx_hash)
            .await?
            .ok_or_else(|| EscrowError::submission(format!("receipt not found for {tx_hash}")))?;
        if !receipt.is_success() {
            return Err(EscrowError::dispute(format!(
                "resolution reverted: {}",
                receipt.revert_reason.as_deref().unwrap_or("unknown reason")
            )));
        }

        // Provisional outcome only; the Resolved events close the record.
        let outcome = decision.outcome;
        let note = decision.note.clone();
        let record = self
            .store
            .update_fields(
                record.id,
                Box::new(move |r| {
                    r.resolution = Some(outcome);
                    r.resolution_note = Some(note);
                }),
            )
            .await?;
        self.store
            .append_event(
                record.id,
                "resolution_submitted",
                EventCause::Admin,
                serde_json::json!({
                    "outcome": decision.outcome.as_str(),
                    "recipient": recipient,
                    "amount_wei": amount_wei.to_string(),
                    "tx_hash": tx_hash,
                }),
                None,
                None,
                None,
            )
            .await?;

        info!(
            "Resolved escrow {} as {}: {amount_wei} wei to {recipient}",
            record.id,
            decision.outcome.as_str()
        );
        Ok(record)
    }

    /// Map a decision onto the on-ledger payout. Parties come from the
    /// trade, not the record: under custodial funding the on-ledger buyer
    /// is the platform key, and refunds must go where the ledger can
    /// actually send them.
    fn payout_terms(
        decision: &ResolutionDecision,
        trade: &Trade,
    ) -> EscrowResult<(String, u128)> {
        match decision.outcome {
            DisputeOutcome::RefundToBuyer => Ok((trade.buyer.clone(), trade.amount_wei)),
            DisputeOutcome::PayoutToSeller => Ok((trade.seller.clone(), trade.amount_wei)),
            DisputeOutcome::PartialSplit => {
                let recipient = decision
                    .recipient
                    .clone()
                    .ok_or_else(|| EscrowError::dispute("partial split requires a recipient"))?;
                let amount_wei = decision
                    .amount_wei
                    .ok_or_else(|| EscrowError::dispute("partial split requires an amount"))?;
                if recipient != trade.buyer && recipient != trade.seller {
                    return Err(EscrowError::dispute(format!(
                        "recipient {recipient} is not a party to trade {}",
                        trade.id
                    )));
                }
                if amount_wei > trade.amount_wei {
                    return Err(EscrowError::dispute(format!(
                        "split amount {amount_wei} exceeds trade amount {}",
                        trade.amount_wei
                    )));
                }
                Ok((recipient, amount_wei))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ledger::{EscrowLedger, LedgerConfig},
        models::AgreementRef,
    };
    use uuid::Uuid;

    const ETH: u128 = 1_000_000_000_000_000_000;

    struct Harness {
        ledger: Arc<EscrowLedger>,
        store: Arc<RecordStore>,
        resolver: DisputeResolver,
    }

    fn harness() -> Harness {
        let ledger = Arc::new(EscrowLedger::new(LedgerConfig::default()));
        let store = Arc::new(RecordStore::new());
        let resolver =
            DisputeResolver::new(DisputeConfig::default(), store.clone(), ledger.clone());
        Harness {
            ledger,
            store,
            resolver,
        }
    }

    /// Set up a funded, disputed escrow mirrored on both sides.
    async fn disputed_escrow(h: &Harness) -> (Uuid, u64) {
        let record = h
            .store
            .create(&AgreementRef {
                agreement_id: 1,
                buyer: "0xbuyer".to_string(),
                seller: "0xseller".to_string(),
                agreed_amount_wei: ETH,
            })
            .await
            .unwrap();

        h.ledger.credit("0xbuyer", 10 * ETH).await;
        let tx = h
            .ledger
            .create_and_fund("0xbuyer", "0xseller", ETH, "{}")
            .await
            .unwrap();
        let trade_id = h.ledger.get_receipt(&tx).await.unwrap().unwrap().events[0]
            .event
            .trade_id();
        h.ledger
            .raise_dispute("0xbuyer", trade_id, "not as described")
            .await
            .unwrap();

        let id = record.id;
        h.store
            .update_state(
                id,
                RecordState::AwaitingFund,
                RecordState::Funded,
                Some(Box::new(move |r| r.trade_id = Some(trade_id))),
            )
            .await
            .unwrap();
        h.store
            .update_state(id, RecordState::Funded, RecordState::Disputed, None)
            .await
            .unwrap();
        (id, trade_id)
    }

    fn decision(escrow_id: Uuid, outcome: DisputeOutcome) -> ResolutionDecision {
        ResolutionDecision {
            escrow_id,
            outcome,
            recipient: None,
            amount_wei: None,
            note: "arbitrated".to_string(),
        }
    }

    #[tokio::test]
    async fn test_refund_to_buyer() {
        let h = harness();
        let (escrow_id, _) = disputed_escrow(&h).await;

        let record = h
            .resolver
            .resolve(&decision(escrow_id, DisputeOutcome::RefundToBuyer))
            .await
            .unwrap();

        // Outcome recorded provisionally, closure left to reconciliation.
        assert_eq!(record.state, RecordState::Disputed);
        assert_eq!(record.resolution, Some(DisputeOutcome::RefundToBuyer));
        assert_eq!(h.ledger.balance_of("0xbuyer").await, 10 * ETH);
        assert_eq!(h.ledger.balance_of("0xseller").await, 0);
    }

    #[tokio::test]
    async fn test_payout_to_seller() {
        let h = harness();
        let (escrow_id, _) = disputed_escrow(&h).await;

        h.resolver
            .resolve(&decision(escrow_id, DisputeOutcome::PayoutToSeller))
            .await
            .unwrap();
        assert_eq!(h.ledger.balance_of("0xseller").await, ETH);
    }

    #[tokio::test]
    async fn test_partial_split_requires_terms() {
        let h = harness();
        let (escrow_id, _) = disputed_escrow(&h).await;

        let err = h
            .resolver
            .resolve(&decision(escrow_id, DisputeOutcome::PartialSplit))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("requires a recipient"));

        let mut d = decision(escrow_id, DisputeOutcome::PartialSplit);
        d.recipient = Some("0xbuyer".to_string());
        let err = h.resolver.resolve(&d).await.unwrap_err();
        assert!(err.to_string().contains("requires an amount"));
    }

    #[tokio::test]
    async fn test_partial_split_pays_both_sides() {
        let h = harness();
        let (escrow_id, _) = disputed_escrow(&h).await;

        let mut d = decision(escrow_id, DisputeOutcome::PartialSplit);
        d.recipient = Some("0xseller".to_string());
        d.amount_wei = Some(ETH / 4);
        h.resolver.resolve(&d).await.unwrap();

        assert_eq!(h.ledger.balance_of("0xseller").await, ETH / 4);
        assert_eq!(h.ledger.balance_of("0xbuyer").await, 9 * ETH + 3 * ETH / 4);
    }

    #[tokio::test]
    async fn test_split_bounds_checked_before_submission() {
        let h = harness();
        let (escrow_id, trade_id) = disputed_escrow(&h).await;
        let head_before = h.ledger.head_block().await.unwrap();

        let mut d = decision(escrow_id, DisputeOutcome::PartialSplit);
        d.recipient = Some("0xstranger".to_string());
        d.amount_wei = Some(ETH);
        assert!(h.resolver.resolve(&d).await.is_err());

        d.recipient = Some("0xbuyer".to_string());
        d.amount_wei = Some(2 * ETH);
        assert!(h.resolver.resolve(&d).await.is_err());

        // Nothing reached the ledger and the dispute is still open.
        assert_eq!(h.ledger.head_block().await.unwrap(), head_before);
        let trade = h.ledger.get_trade(trade_id).await.unwrap().unwrap();
        assert_eq!(trade.state, crate::models::TradeState::Disputed);
    }

    #[tokio::test]
    async fn test_resolve_requires_open_dispute() {
        let h = harness();
        let record = h
            .store
            .create(&AgreementRef {
                agreement_id: 9,
                buyer: "0xbuyer".to_string(),
                seller: "0xseller".to_string(),
                agreed_amount_wei: ETH,
            })
            .await
            .unwrap();

        let err = h
            .resolver
            .resolve(&decision(record.id, DisputeOutcome::RefundToBuyer))
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::Dispute(_)));
    }
}
