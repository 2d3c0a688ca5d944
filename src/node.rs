//! Settlement node - high-level API for the escrow platform
//!
//! This module wires the underlying components together (ledger
//! connection, record store, funding coordinator, reconciler, dispute
//! resolver) and exposes the permission-checked operations the
//! marketplace layer calls. Every mutating call submits to the ledger
//! first and writes the local record provisionally; reconciliation is
//! what makes a write final.

use crate::{
    EscrowResult,
    config::NodeSettings,
    dispute::DisputeResolver,
    error::EscrowError,
    funding::FundingCoordinator,
    ledger::{EscrowLedger, LedgerConnection},
    models::{
        AgreementRef, EscrowEventRow, EscrowPermissions, EscrowRecord, EventCause, FundingPath,
        RecordState, ResolutionDecision,
    },
    notifier::{LogNotifier, NotificationSink},
    record_store::RecordStore,
    reconciler::EventReconciler,
    signer::{PlatformKeySigner, TradeSigner},
    verifier::TransactionVerifier,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Escrow status response for the marketplace/UI layer
#[derive(Debug, Clone)]
pub struct EscrowStatus {
    pub record: EscrowRecord,
    /// Derived for the requesting actor, never stored
    pub permissions: EscrowPermissions,
    pub events: Vec<EscrowEventRow>,
}

/// Main settlement node that coordinates all components
pub struct SettlementNode {
    store: Arc<RecordStore>,
    ledger: Arc<EscrowLedger>,
    signer: Arc<dyn TradeSigner>,
    funding: FundingCoordinator,
    reconciler: Arc<EventReconciler>,
    resolver: DisputeResolver,
}

impl SettlementNode {
    /// Create a node with all components initialized from settings.
    pub fn new(settings: NodeSettings) -> EscrowResult<Self> {
        Self::with_notifier(settings, Arc::new(LogNotifier))
    }

    pub fn with_notifier(
        settings: NodeSettings,
        notifier: Arc<dyn NotificationSink>,
    ) -> EscrowResult<Self> {
        info!("Initializing settlement node");

        let store = Arc::new(RecordStore::new());
        let ledger = Arc::new(EscrowLedger::new(settings.ledger));
        let connection: Arc<dyn LedgerConnection> = ledger.clone();

        let signer: Arc<dyn TradeSigner> = match &settings.platform_key_hex {
            Some(hex) => Arc::new(PlatformKeySigner::from_hex(hex)?),
            None => Arc::new(PlatformKeySigner::random()),
        };

        let funding = FundingCoordinator::new(
            settings.funding,
            store.clone(),
            connection.clone(),
            TransactionVerifier::new(settings.verifier, connection.clone()),
            signer.clone(),
        );
        let reconciler = Arc::new(EventReconciler::new(
            settings.reconciler,
            store.clone(),
            connection.clone(),
            notifier,
        ));
        let resolver = DisputeResolver::new(settings.dispute, store.clone(), connection);

        info!("Settlement node initialized");
        Ok(Self {
            store,
            ledger,
            signer,
            funding,
            reconciler,
            resolver,
        })
    }

    pub fn store(&self) -> Arc<RecordStore> {
        self.store.clone()
    }

    pub fn ledger(&self) -> Arc<EscrowLedger> {
        self.ledger.clone()
    }

    /// Open an escrow for a negotiated agreement.
    pub async fn create_escrow(&self, agreement: &AgreementRef) -> EscrowResult<EscrowRecord> {
        self.store.create(agreement).await
    }

    /// Current record, audit log, and the caller's derived permissions.
    pub async fn status(&self, escrow_id: Uuid, actor: &str) -> EscrowResult<EscrowStatus> {
        let record = self.store.get(escrow_id).await?;
        let permissions = record.permissions_for(actor, Utc::now());
        let events = self.store.events_for(escrow_id).await;
        Ok(EscrowStatus {
            record,
            permissions,
            events,
        })
    }

    /// Self-custodial funding: the buyer reports the hash of the funding
    /// transaction they submitted with their own key.
    pub async fn submit_funding_tx(
        &self,
        escrow_id: Uuid,
        actor: &str,
        tx_hash: &str,
    ) -> EscrowResult<EscrowRecord> {
        let record = self.store.get(escrow_id).await?;
        if !record.permissions_for(actor, Utc::now()).can_be_funded {
            return Err(EscrowError::validation(format!(
                "{actor} may not fund escrow {escrow_id}"
            )));
        }
        self.funding.fund_self_custodial(escrow_id, tx_hash).await
    }

    /// Custodial funding: the platform key submits on the buyer's behalf.
    pub async fn fund_custodial(&self, escrow_id: Uuid, actor: &str) -> EscrowResult<EscrowRecord> {
        let record = self.store.get(escrow_id).await?;
        if !record.permissions_for(actor, Utc::now()).can_be_funded {
            return Err(EscrowError::validation(format!(
                "{actor} may not fund escrow {escrow_id}"
            )));
        }
        self.funding.fund_custodial(escrow_id).await
    }

    /// Release the held value to the seller, minus the platform fee.
    pub async fn confirm_delivery(&self, escrow_id: Uuid, actor: &str) -> EscrowResult<EscrowRecord> {
        let record = self.store.get(escrow_id).await?;
        if !record.permissions_for(actor, Utc::now()).can_confirm_delivery {
            return Err(EscrowError::validation(format!(
                "{actor} may not confirm delivery for escrow {escrow_id}"
            )));
        }
        let trade_id = Self::linked_trade(&record)?;
        let caller = self.ledger_caller(&record, actor);

        let tx_hash = self.ledger.confirm_delivery(&caller, trade_id).await?;
        self.check_receipt(&tx_hash).await?;

        let record = self
            .store
            .update_state(escrow_id, RecordState::Funded, RecordState::Complete, None)
            .await?;
        self.store
            .append_event(
                escrow_id,
                "delivery_confirmed",
                EventCause::Admin,
                serde_json::json!({ "by": actor, "tx_hash": tx_hash }),
                None,
                None,
                None,
            )
            .await?;
        Ok(record)
    }

    /// Freeze the held value pending arbitration.
    pub async fn raise_dispute(
        &self,
        escrow_id: Uuid,
        actor: &str,
        reason: &str,
    ) -> EscrowResult<EscrowRecord> {
        let record = self.store.get(escrow_id).await?;
        if !record.permissions_for(actor, Utc::now()).can_raise_dispute {
            return Err(EscrowError::validation(format!(
                "{actor} may not dispute escrow {escrow_id}"
            )));
        }
        let trade_id = Self::linked_trade(&record)?;
        let caller = self.ledger_caller(&record, actor);

        let tx_hash = self.ledger.raise_dispute(&caller, trade_id, reason).await?;
        self.check_receipt(&tx_hash).await?;

        let reason_owned = reason.to_string();
        let record = self
            .store
            .update_state(
                escrow_id,
                RecordState::Funded,
                RecordState::Disputed,
                Some(Box::new(move |r| r.dispute_reason = Some(reason_owned))),
            )
            .await?;
        self.store
            .append_event(
                escrow_id,
                "dispute_raised",
                EventCause::Admin,
                serde_json::json!({ "by": actor, "reason": reason, "tx_hash": tx_hash }),
                None,
                None,
                None,
            )
            .await?;
        Ok(record)
    }

    /// Apply an arbitration decision to a disputed escrow.
    pub async fn resolve_dispute(
        &self,
        decision: &ResolutionDecision,
    ) -> EscrowResult<EscrowRecord> {
        self.resolver.resolve(decision).await
    }

    /// Reclaim the held value after the refund deadline. Callable by
    /// anyone once the trade has timed out.
    pub async fn claim_timeout_refund(
        &self,
        escrow_id: Uuid,
        actor: &str,
    ) -> EscrowResult<EscrowRecord> {
        let record = self.store.get(escrow_id).await?;
        if !record.permissions_for(actor, Utc::now()).can_timeout_refund {
            return Err(EscrowError::validation(format!(
                "escrow {escrow_id} is not eligible for a timeout refund"
            )));
        }
        let trade_id = Self::linked_trade(&record)?;

        let tx_hash = self.ledger.timeout_refund(actor, trade_id).await?;
        self.check_receipt(&tx_hash).await?;

        let record = self
            .store
            .update_state(escrow_id, RecordState::Funded, RecordState::Complete, None)
            .await?;
        self.store
            .append_event(
                escrow_id,
                "timeout_refund_claimed",
                EventCause::Admin,
                serde_json::json!({ "by": actor, "tx_hash": tx_hash }),
                None,
                None,
                None,
            )
            .await?;
        Ok(record)
    }

    /// One reconciliation round; the background loop calls this too.
    pub async fn reconcile_once(&self) -> EscrowResult<usize> {
        self.reconciler.poll_once().await
    }

    /// Submit refunds for every escrow past its deadline.
    pub async fn sweep_timeouts(&self) -> EscrowResult<usize> {
        self.reconciler.sweep_timeouts(self.signer.address()).await
    }

    /// Escrows a party participates in, optionally filtered by state.
    pub async fn escrows_for(
        &self,
        party: &str,
        state: Option<RecordState>,
    ) -> Vec<EscrowRecord> {
        self.store.list_by_party(party, state).await
    }

    /// Open disputes awaiting arbitration, oldest first.
    pub async fn open_disputes(&self) -> Vec<EscrowRecord> {
        self.store.list_disputed().await
    }

    /// Escrows that have been waiting on funding confirmation for longer
    /// than `older_than`, surfaced for support review.
    pub async fn stalled_fundings(&self, older_than: chrono::Duration) -> Vec<EscrowRecord> {
        self.store
            .awaiting_confirmation_since(Utc::now() - older_than)
            .await
    }

    /// Run the reconciler loop on the runtime until the handle is aborted.
    pub fn spawn_reconciler(&self) -> tokio::task::JoinHandle<()> {
        let reconciler = self.reconciler.clone();
        tokio::spawn(async move { reconciler.run().await })
    }

    fn linked_trade(record: &EscrowRecord) -> EscrowResult<u64> {
        record.trade_id.ok_or_else(|| {
            EscrowError::validation(format!("escrow {} has no linked trade", record.id))
        })
    }

    /// Map a platform actor onto the identity the ledger knows. Under
    /// custodial funding the on-ledger buyer is the platform key, so the
    /// real buyer's calls are submitted under it.
    fn ledger_caller(&self, record: &EscrowRecord, actor: &str) -> String {
        if record.funding_path == Some(FundingPath::Custodial) && actor == record.buyer {
            self.signer.address().to_string()
        } else {
            actor.to_string()
        }
    }

    async fn check_receipt(&self, tx_hash: &str) -> EscrowResult<()> {
        let receipt = self
            .ledger
            .get_receipt(tx_hash)
            .await?
            .ok_or_else(|| EscrowError::submission(format!("receipt not found for {tx_hash}")))?;
        if !receipt.is_success() {
            return Err(EscrowError::submission(format!(
                "transaction reverted: {}",
                receipt.revert_reason.as_deref().unwrap_or("unknown reason")
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ledger::LedgerConfig, models::DisputeOutcome};

    const ETH: u128 = 1_000_000_000_000_000_000;

    fn agreement() -> AgreementRef {
        AgreementRef {
            agreement_id: 1,
            buyer: "0xbuyer".to_string(),
            seller: "0xseller".to_string(),
            agreed_amount_wei: ETH,
        }
    }

    fn node() -> SettlementNode {
        SettlementNode::new(NodeSettings::default()).unwrap()
    }

    async fn self_custodial_funded(node: &SettlementNode) -> Uuid {
        let record = node.create_escrow(&agreement()).await.unwrap();
        node.ledger().credit("0xbuyer", 10 * ETH).await;
        let tx = node
            .ledger()
            .create_and_fund("0xbuyer", "0xseller", ETH, "{}")
            .await
            .unwrap();
        node.ledger().mine_blocks(3).await;
        node.submit_funding_tx(record.id, "0xbuyer", &tx)
            .await
            .unwrap();
        record.id
    }

    #[tokio::test]
    async fn test_full_delivery_lifecycle() {
        let node = node();
        let escrow_id = self_custodial_funded(&node).await;

        let status = node.status(escrow_id, "0xseller").await.unwrap();
        assert!(status.permissions.can_confirm_delivery);
        assert!(!status.permissions.can_be_funded);

        let record = node.confirm_delivery(escrow_id, "0xseller").await.unwrap();
        assert_eq!(record.state, RecordState::Complete);

        node.reconcile_once().await.unwrap();
        let fee = ETH / 100;
        assert_eq!(node.ledger().balance_of("0xseller").await, ETH - fee);
        assert_eq!(node.ledger().balance_of("0xfees").await, fee);
    }

    #[tokio::test]
    async fn test_stranger_denied_everywhere() {
        let node = node();
        let escrow_id = self_custodial_funded(&node).await;

        assert!(node.confirm_delivery(escrow_id, "0xstranger").await.is_err());
        assert!(
            node.raise_dispute(escrow_id, "0xstranger", "meddling")
                .await
                .is_err()
        );
        assert!(
            node.submit_funding_tx(escrow_id, "0xbuyer", "0xagain")
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_dispute_lifecycle() {
        let node = node();
        let escrow_id = self_custodial_funded(&node).await;

        let record = node
            .raise_dispute(escrow_id, "0xbuyer", "not as described")
            .await
            .unwrap();
        assert_eq!(record.state, RecordState::Disputed);

        node.resolve_dispute(&ResolutionDecision {
            escrow_id,
            outcome: DisputeOutcome::RefundToBuyer,
            recipient: None,
            amount_wei: None,
            note: "refund".to_string(),
        })
        .await
        .unwrap();

        node.reconcile_once().await.unwrap();
        let record = node.store().get(escrow_id).await.unwrap();
        assert_eq!(record.state, RecordState::Complete);
        assert_eq!(node.ledger().balance_of("0xbuyer").await, 10 * ETH);
    }

    #[tokio::test]
    async fn test_timeout_refund_claimable_by_anyone() {
        let mut settings = NodeSettings::default();
        settings.ledger = LedgerConfig {
            default_timeout_secs: 0,
            ..LedgerConfig::default()
        };
        let node = SettlementNode::new(settings).unwrap();
        let escrow_id = self_custodial_funded(&node).await;

        let record = node
            .claim_timeout_refund(escrow_id, "0xanyone")
            .await
            .unwrap();
        assert_eq!(record.state, RecordState::Complete);
        assert_eq!(node.ledger().balance_of("0xbuyer").await, 10 * ETH);
    }

    #[tokio::test]
    async fn test_custodial_lifecycle_maps_buyer_to_platform_key() {
        let node = node();
        let record = node.create_escrow(&agreement()).await.unwrap();
        node.ledger().credit(node.signer.address(), 2 * ETH).await;

        let funded = node.fund_custodial(record.id, "0xbuyer").await.unwrap();
        assert_eq!(funded.funding_path, Some(FundingPath::Custodial));

        // The real buyer confirms; the submission goes out under the
        // platform key, the only buyer the ledger knows.
        let closed = node.confirm_delivery(record.id, "0xbuyer").await.unwrap();
        assert_eq!(closed.state, RecordState::Complete);
        let fee = ETH / 100;
        assert_eq!(node.ledger().balance_of("0xseller").await, ETH - fee);
    }

    #[tokio::test]
    async fn test_open_disputes_feed_the_resolver() {
        let node = node();
        let escrow_id = self_custodial_funded(&node).await;
        assert!(node.open_disputes().await.is_empty());

        node.raise_dispute(escrow_id, "0xbuyer", "late delivery")
            .await
            .unwrap();
        let queue = node.open_disputes().await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].id, escrow_id);

        node.resolve_dispute(&ResolutionDecision {
            escrow_id,
            outcome: DisputeOutcome::PayoutToSeller,
            recipient: None,
            amount_wei: None,
            note: "delivery proof accepted".to_string(),
        })
        .await
        .unwrap();
        node.reconcile_once().await.unwrap();
        assert!(node.open_disputes().await.is_empty());

        let settled = node.escrows_for("0xbuyer", Some(RecordState::Complete)).await;
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].id, escrow_id);
    }

    #[tokio::test]
    async fn test_stalled_fundings_surfaced_until_confirmed() {
        let node = node();
        let record = node.create_escrow(&agreement()).await.unwrap();

        let stalled = node.stalled_fundings(chrono::Duration::zero()).await;
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].id, record.id);

        node.ledger().credit("0xbuyer", 10 * ETH).await;
        let tx = node
            .ledger()
            .create_and_fund("0xbuyer", "0xseller", ETH, "{}")
            .await
            .unwrap();
        node.ledger().mine_blocks(3).await;
        node.submit_funding_tx(record.id, "0xbuyer", &tx)
            .await
            .unwrap();

        assert!(node.stalled_fundings(chrono::Duration::zero()).await.is_empty());
    }

    #[tokio::test]
    async fn test_status_reflects_reconciled_events() {
        let node = node();
        let escrow_id = self_custodial_funded(&node).await;
        node.reconcile_once().await.unwrap();

        let status = node.status(escrow_id, "0xbuyer").await.unwrap();
        assert!(status.record.is_confirmed);
        let types: Vec<&str> = status.events.iter().map(|e| e.event_type.as_str()).collect();
        assert!(types.contains(&"funding_submitted"));
        assert!(types.contains(&"escrow_created"));
        assert!(types.contains(&"funded"));
    }
}
