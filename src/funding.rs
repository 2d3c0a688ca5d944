//! Funding coordinator - moves escrows from created to funded
//!
//! Two paths reach the funded state. Self-custodial: the buyer signs and
//! submits the funding transaction with their own key and hands us the
//! transaction hash, which we verify against the ledger with bounded
//! retries. Custodial: the platform key submits on the buyer's behalf,
//! a fallback that trades self-custody for convenience. Either way the
//! local write is provisional until reconciliation echoes it back.

use crate::{
    EscrowResult,
    error::EscrowError,
    ledger::LedgerConnection,
    models::{EscrowRecord, EventCause, FundingPath, LedgerEvent, RecordState},
    record_store::RecordStore,
    signer::TradeSigner,
    verifier::{ExpectedFunding, TransactionVerifier},
};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};
use uuid::Uuid;

/// Configuration for the funding coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FundingConfig {
    /// Verification attempts before giving up on a submitted hash
    pub verify_attempts: u32,
    /// Delay between verification attempts
    pub retry_delay_ms: u64,
}

impl Default for FundingConfig {
    fn default() -> Self {
        Self {
            verify_attempts: 5,
            retry_delay_ms: 500,
        }
    }
}

/// Main funding coordinator
pub struct FundingCoordinator {
    config: FundingConfig,
    store: Arc<RecordStore>,
    ledger: Arc<dyn LedgerConnection>,
    verifier: TransactionVerifier,
    signer: Arc<dyn TradeSigner>,
}

impl FundingCoordinator {
    pub fn new(
        config: FundingConfig,
        store: Arc<RecordStore>,
        ledger: Arc<dyn LedgerConnection>,
        verifier: TransactionVerifier,
        signer: Arc<dyn TradeSigner>,
    ) -> Self {
        Self {
            config,
            store,
            ledger,
            verifier,
            signer,
        }
    }

    /// Self-custodial path: the buyer already submitted the funding
    /// transaction themselves; verify the hash they reported.
    ///
    /// The record moves to `PendingVerification` immediately and to
    /// `Funded` only once the ledger attests to the funding. When every
    /// attempt fails the record stays in `PendingVerification` for a
    /// later retry or administrative review.
    pub async fn fund_self_custodial(
        &self,
        escrow_id: Uuid,
        tx_hash: &str,
    ) -> EscrowResult<EscrowRecord> {
        let tx = tx_hash.to_string();
        let record = self
            .store
            .update_state(
                escrow_id,
                RecordState::AwaitingFund,
                RecordState::PendingVerification,
                Some(Box::new(move |r| {
                    r.funding_tx = Some(tx);
                    r.funding_path = Some(FundingPath::SelfCustodial);
                })),
            )
            .await?;
        self.store
            .append_event(
                escrow_id,
                "funding_submitted",
                EventCause::Admin,
                serde_json::json!({ "path": "self_custodial", "tx_hash": tx_hash }),
                None,
                None,
                None,
            )
            .await?;

        let expected = ExpectedFunding {
            trade_id: record.trade_id,
            buyer: record.buyer.clone(),
            seller: record.seller.clone(),
            amount_wei: record.expected_amount_wei,
        };

        let mut last_err = EscrowError::verification("no verification attempt made");
        for attempt in 1..=self.config.verify_attempts {
            match self.verifier.verify_funding_tx(tx_hash, &expected).await {
                Ok(verified) => {
                    let trade = self.ledger.get_trade(verified.trade_id).await?;
                    let timeout_at = trade.map(|t| t.timeout_at);
                    let confirmations = verified.confirmations;
                    let trade_id = verified.trade_id;
                    let record = self
                        .store
                        .update_state(
                            escrow_id,
                            RecordState::PendingVerification,
                            RecordState::Funded,
                            Some(Box::new(move |r| {
                                r.trade_id = Some(trade_id);
                                r.confirmations = confirmations;
                                r.is_confirmed = true;
                                r.timeout_at = timeout_at;
                            })),
                        )
                        .await?;
                    self.store
                        .append_event(
                            escrow_id,
                            "funding_verified",
                            EventCause::Admin,
                            serde_json::json!({
                                "trade_id": trade_id,
                                "amount_wei": verified.amount_wei.to_string(),
                                "confirmations": confirmations,
                            }),
                            None,
                            None,
                            None,
                        )
                        .await?;
                    info!("Escrow {escrow_id} funded self-custodially as trade {trade_id}");
                    return Ok(record);
                }
                Err(e) => {
                    warn!(
                        "Verification attempt {attempt}/{} failed for escrow {escrow_id}: {e}",
                        self.config.verify_attempts
                    );
                    last_err = e;
                    if attempt < self.config.verify_attempts {
                        tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms))
                            .await;
                    }
                }
            }
        }

        // Exhausted; the record stays in pending verification.
        self.store
            .append_event(
                escrow_id,
                "funding_verification_failed",
                EventCause::Admin,
                serde_json::json!({ "tx_hash": tx_hash, "error": last_err.to_string() }),
                None,
                None,
                None,
            )
            .await?;
        Err(last_err)
    }

    /// Custodial path: the platform key creates and funds the trade in a
    /// single submission on the buyer's behalf. On-ledger, the buyer of
    /// record is the platform address; the local record keeps the real
    /// parties and flags the reduced trust level in the audit log.
    pub async fn fund_custodial(&self, escrow_id: Uuid) -> EscrowResult<EscrowRecord> {
        let record = self.store.get(escrow_id).await?;
        if record.state != RecordState::AwaitingFund {
            return Err(EscrowError::state_transition(
                record.state.as_str().to_string(),
                RecordState::Funded.as_str().to_string(),
                "custodial funding requires an unfunded escrow".to_string(),
            ));
        }

        let metadata = serde_json::json!({ "escrow_id": escrow_id }).to_string();
        // The signature authorizes this specific submission.
        let payload = format!(
            "fund:{escrow_id}:{}:{}",
            record.seller, record.expected_amount_wei
        );
        self.signer.sign(payload.as_bytes()).await?;

        let tx_hash = self
            .ledger
            .create_and_fund(
                self.signer.address(),
                &record.seller,
                record.expected_amount_wei,
                &metadata,
            )
            .await?;
        let receipt = self
            .ledger
            .get_receipt(&tx_hash)
            .await?
            .ok_or_else(|| EscrowError::submission(format!("receipt not found for {tx_hash}")))?;

        if !receipt.is_success() {
            self.store
                .append_event(
                    escrow_id,
                    "funding_submission_reverted",
                    EventCause::Admin,
                    serde_json::json!({
                        "tx_hash": tx_hash,
                        "reason": receipt.revert_reason,
                    }),
                    None,
                    None,
                    None,
                )
                .await?;
            return Err(EscrowError::submission(format!(
                "custodial funding reverted: {}",
                receipt.revert_reason.as_deref().unwrap_or("unknown reason")
            )));
        }

        let mut trade_id = None;
        let mut funded_amount = None;
        for sealed in &receipt.events {
            match &sealed.event {
                LedgerEvent::EscrowCreated { trade_id: id, .. } => trade_id = Some(*id),
                LedgerEvent::Funded { amount_wei, .. } => funded_amount = Some(*amount_wei),
                _ => {}
            }
        }
        let trade_id = trade_id.ok_or_else(|| {
            EscrowError::submission(format!("no creation event emitted by {tx_hash}"))
        })?;

        // The ledger holding a different amount than agreed is a
        // consistency failure, never something to paper over.
        if funded_amount != Some(record.expected_amount_wei) {
            self.store
                .halt(
                    escrow_id,
                    &format!(
                        "custodial funding amount {funded_amount:?} != expected {}",
                        record.expected_amount_wei
                    ),
                )
                .await?;
            return Err(EscrowError::consistency(format!(
                "escrow {escrow_id} halted: funded amount does not match agreement"
            )));
        }

        let trade = self.ledger.get_trade(trade_id).await?;
        let timeout_at = trade.map(|t| t.timeout_at);
        let head = self.ledger.head_block().await?;
        let confirmations = head.saturating_sub(receipt.block_number);
        // Our own receipt proves the funding; the confirmation flag still
        // waits for the depth threshold, flipped by reconciliation echoes.
        let is_confirmed = confirmations >= self.verifier.min_confirmations();

        let tx = tx_hash.clone();
        let record = self
            .store
            .update_state(
                escrow_id,
                RecordState::AwaitingFund,
                RecordState::Funded,
                Some(Box::new(move |r| {
                    r.trade_id = Some(trade_id);
                    r.funding_tx = Some(tx);
                    r.funding_path = Some(FundingPath::Custodial);
                    r.confirmations = confirmations;
                    r.is_confirmed = is_confirmed;
                    r.timeout_at = timeout_at;
                })),
            )
            .await?;
        self.store
            .append_event(
                escrow_id,
                "funded",
                EventCause::Admin,
                serde_json::json!({
                    "path": "custodial",
                    "trust_reducing": true,
                    "trade_id": trade_id,
                    "tx_hash": tx_hash,
                }),
                None,
                None,
                None,
            )
            .await?;
        info!("Escrow {escrow_id} funded custodially as trade {trade_id}");
        Ok(record)
    }
}
