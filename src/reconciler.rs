//! Event reconciler - folds ledger events into the record store
//!
//! The ledger log is authoritative; local records are a mirror. The
//! reconciler replays emitted events from a per-connection block cursor
//! and folds each one into its record through the forward-only lattice,
//! so replays and provisional local writes converge instead of
//! conflicting. The cursor moves only after a whole batch is applied:
//! a crash mid-batch replays events, and the `(tx_hash, log_index)`
//! idempotence key makes the replay harmless.

use crate::{
    EscrowResult,
    error::EscrowError,
    ledger::LedgerConnection,
    models::{EscrowRecord, EventCause, LedgerEvent, RecordState, SealedEvent},
    notifier::{EscrowNotice, NotificationSink},
    record_store::RecordStore,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Configuration for the event reconciler
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Delay between polling rounds
    pub poll_interval_ms: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
        }
    }
}

/// Main event reconciler
pub struct EventReconciler {
    config: ReconcilerConfig,
    store: Arc<RecordStore>,
    ledger: Arc<dyn LedgerConnection>,
    notifier: Arc<dyn NotificationSink>,
}

impl EventReconciler {
    pub fn new(
        config: ReconcilerConfig,
        store: Arc<RecordStore>,
        ledger: Arc<dyn LedgerConnection>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            config,
            store,
            ledger,
            notifier,
        }
    }

    /// Poll-and-fold loop. Errors are logged and retried on the next
    /// round rather than tearing the loop down.
    pub async fn run(&self) {
        info!(
            "Reconciler started for connection {}",
            self.ledger.connection_id()
        );
        loop {
            if let Err(e) = self.poll_once().await {
                error!("Reconciliation round failed: {e}");
            }
            tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)).await;
        }
    }

    /// One reconciliation round: fetch events past the cursor, fold them,
    /// then advance the cursor. Returns how many events were applied.
    pub async fn poll_once(&self) -> EscrowResult<usize> {
        let connection_id = self.ledger.connection_id();
        let cursor = self.store.load_cursor(connection_id).await;
        let head = self.ledger.head_block().await?;
        if head <= cursor {
            return Ok(0);
        }

        let events = self.ledger.events_in_range(cursor + 1, head).await?;
        let mut applied = 0;
        for sealed in &events {
            if self.apply_event(sealed).await? {
                applied += 1;
            }
        }

        // Cursor moves only after the whole batch went through.
        self.store.save_cursor(connection_id, head).await;
        if applied > 0 {
            debug!("Applied {applied} ledger events up to block {head}");
        }
        Ok(applied)
    }

    /// Submit timeout refunds for every funded escrow past its deadline.
    /// The resulting `timeout_refund` events close the records on the
    /// next reconciliation round.
    pub async fn sweep_timeouts(&self, caller: &str) -> EscrowResult<usize> {
        let eligible = self.store.timeout_eligible(Utc::now()).await;
        let mut submitted = 0;
        for record in eligible {
            let Some(trade_id) = record.trade_id else {
                continue;
            };
            let tx_hash = self.ledger.timeout_refund(caller, trade_id).await?;
            match self.ledger.get_receipt(&tx_hash).await? {
                Some(receipt) if receipt.is_success() => {
                    info!(
                        "Submitted timeout refund for escrow {} (trade {trade_id}): {tx_hash}",
                        record.id
                    );
                    submitted += 1;
                }
                Some(receipt) => {
                    // Local clock ran ahead of the ledger's deadline, or
                    // the trade already closed; leave it for a later sweep.
                    warn!(
                        "Timeout refund for escrow {} reverted: {}",
                        record.id,
                        receipt.revert_reason.as_deref().unwrap_or("unknown reason")
                    );
                }
                None => {
                    warn!("No receipt for timeout refund {tx_hash} on escrow {}", record.id);
                }
            }
        }
        Ok(submitted)
    }

    /// Fold one sealed event into its record. Returns whether the event
    /// was new to the audit log.
    async fn apply_event(&self, sealed: &SealedEvent) -> EscrowResult<bool> {
        let Some(record) = self.resolve_record(&sealed.event).await? else {
            // A trade this platform never opened; not ours to track.
            debug!(
                "Ignoring event {} for unknown trade {}",
                sealed.event.name(),
                sealed.event.trade_id()
            );
            return Ok(false);
        };

        let inserted = self
            .store
            .append_event(
                record.id,
                sealed.event.name(),
                EventCause::Ledger,
                serde_json::to_value(&sealed.event)?,
                Some(sealed.tx_hash.clone()),
                Some(sealed.block_number),
                Some(sealed.log_index),
            )
            .await?;

        // The row dedupe guards the audit log only; the fold runs on
        // every pass so a round that died between the append and the
        // fold is repaired when the batch replays. The rank check makes
        // a re-fold of an already-applied event a no-op.
        self.fold(&record, sealed).await?;
        Ok(inserted)
    }

    /// Find the record an event belongs to. Creation events are matched
    /// through the `escrow_id` embedded in the trade metadata; everything
    /// else goes through the linked trade id.
    async fn resolve_record(&self, event: &LedgerEvent) -> EscrowResult<Option<EscrowRecord>> {
        if let LedgerEvent::EscrowCreated {
            trade_id, metadata, ..
        } = event
        {
            if let Some(record) = self.store.get_by_trade_id(*trade_id).await? {
                return Ok(Some(record));
            }
            let Ok(meta) = serde_json::from_str::<serde_json::Value>(metadata) else {
                return Ok(None);
            };
            let Some(escrow_id) = meta
                .get("escrow_id")
                .and_then(|v| v.as_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            else {
                return Ok(None);
            };
            let Ok(record) = self.store.get(escrow_id).await else {
                return Ok(None);
            };
            // Link the ledger trade to the local record.
            let id = *trade_id;
            let record = self
                .store
                .update_fields(record.id, Box::new(move |r| r.trade_id = Some(id)))
                .await?;
            return Ok(Some(record));
        }
        self.store.get_by_trade_id(event.trade_id()).await
    }

    async fn fold(&self, record: &EscrowRecord, sealed: &SealedEvent) -> EscrowResult<()> {
        let tx_hash = sealed.tx_hash.clone();
        let (target, mutation): (Option<RecordState>, Option<Box<dyn FnOnce(&mut EscrowRecord) + Send>>) =
            match &sealed.event {
                LedgerEvent::EscrowCreated { .. } | LedgerEvent::DeliveryConfirmed { .. } => {
                    (None, None)
                }
                LedgerEvent::Funded { trade_id, .. } => {
                    // The event omits the refund deadline; the trade carries it.
                    let timeout_at = self
                        .ledger
                        .get_trade(*trade_id)
                        .await?
                        .map(|t| t.timeout_at);
                    (
                        Some(RecordState::Funded),
                        Some(Box::new(move |r| {
                            r.is_confirmed = true;
                            if r.timeout_at.is_none() {
                                r.timeout_at = timeout_at;
                            }
                            if r.funding_tx.is_none() {
                                r.funding_tx = Some(tx_hash);
                            }
                        })),
                    )
                }
                LedgerEvent::Disputed { reason, .. } => {
                    let reason = reason.clone();
                    (
                        Some(RecordState::Disputed),
                        Some(Box::new(move |r| {
                            if r.dispute_reason.is_none() {
                                r.dispute_reason = Some(reason);
                            }
                        })),
                    )
                }
                LedgerEvent::Resolved { resolution, .. } => {
                    let note = resolution.clone();
                    (
                        Some(RecordState::Complete),
                        Some(Box::new(move |r| {
                            if r.resolution_note.is_none() {
                                r.resolution_note = Some(note);
                            }
                        })),
                    )
                }
                LedgerEvent::Released { .. } | LedgerEvent::TimeoutRefund { .. } => {
                    (Some(RecordState::Complete), None)
                }
            };

        let Some(target) = target else {
            return Ok(());
        };

        let current = self.store.get(record.id).await?;
        if current.state.rank() >= target.rank() {
            // Replay or echo of a provisional local write. Funding echoes
            // still flip the confirmation flag.
            if current.state == RecordState::Funded
                && target == RecordState::Funded
                && !current.is_confirmed
            {
                self.store
                    .update_fields(record.id, Box::new(|r| r.is_confirmed = true))
                    .await?;
            }
            return Ok(());
        }

        match self
            .store
            .update_state(record.id, current.state, target, mutation)
            .await
        {
            Ok(updated) => {
                self.notifier
                    .publish(EscrowNotice {
                        escrow_id: updated.id,
                        event: sealed.event.name().to_string(),
                        state: updated.state.as_str().to_string(),
                        detail: serde_json::to_value(&sealed.event)?,
                    })
                    .await?;
                Ok(())
            }
            // Halted records wait for an administrator; the audit row is
            // already recorded, so skip the fold without killing the batch.
            Err(EscrowError::Consistency(msg)) => {
                warn!("Skipping fold for halted escrow {}: {msg}", record.id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ledger::{EscrowLedger, LedgerConfig},
        models::AgreementRef,
        notifier::ChannelNotifier,
    };
    use tokio::sync::mpsc;

    const ETH: u128 = 1_000_000_000_000_000_000;

    struct Harness {
        ledger: Arc<EscrowLedger>,
        store: Arc<RecordStore>,
        reconciler: EventReconciler,
        notices: mpsc::UnboundedReceiver<EscrowNotice>,
    }

    fn harness_with(config: LedgerConfig) -> Harness {
        let ledger = Arc::new(EscrowLedger::new(config));
        let store = Arc::new(RecordStore::new());
        let (notifier, notices) = ChannelNotifier::new();
        let reconciler = EventReconciler::new(
            ReconcilerConfig::default(),
            store.clone(),
            ledger.clone(),
            Arc::new(notifier),
        );
        Harness {
            ledger,
            store,
            reconciler,
            notices,
        }
    }

    fn harness() -> Harness {
        harness_with(LedgerConfig::default())
    }

    fn agreement() -> AgreementRef {
        AgreementRef {
            agreement_id: 1,
            buyer: "0xbuyer".to_string(),
            seller: "0xseller".to_string(),
            agreed_amount_wei: ETH,
        }
    }

    /// Fund on-ledger with the record's id embedded in trade metadata,
    /// the shape every coordinator submission uses.
    async fn fund_on_ledger(h: &Harness, escrow_id: Uuid) -> u64 {
        h.ledger.credit("0xbuyer", 10 * ETH).await;
        let metadata = serde_json::json!({ "escrow_id": escrow_id }).to_string();
        let tx = h
            .ledger
            .create_and_fund("0xbuyer", "0xseller", ETH, &metadata)
            .await
            .unwrap();
        let receipt = h.ledger.get_receipt(&tx).await.unwrap().unwrap();
        assert!(receipt.is_success());
        receipt.events[0].event.trade_id()
    }

    #[tokio::test]
    async fn test_poll_links_and_funds_record() {
        let mut h = harness();
        let record = h.store.create(&agreement()).await.unwrap();
        let trade_id = fund_on_ledger(&h, record.id).await;

        let applied = h.reconciler.poll_once().await.unwrap();
        assert_eq!(applied, 2); // escrow_created + funded

        let record = h.store.get(record.id).await.unwrap();
        assert_eq!(record.state, RecordState::Funded);
        assert_eq!(record.trade_id, Some(trade_id));
        assert!(record.is_confirmed);

        let notice = h.notices.recv().await.unwrap();
        assert_eq!(notice.event, "funded");
        assert_eq!(notice.state, "funded");
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let h = harness();
        let record = h.store.create(&agreement()).await.unwrap();
        fund_on_ledger(&h, record.id).await;

        assert_eq!(h.reconciler.poll_once().await.unwrap(), 2);
        // Nothing new past the cursor.
        assert_eq!(h.reconciler.poll_once().await.unwrap(), 0);

        // Force a full replay from block zero; the idempotence key
        // swallows every event.
        h.store.save_cursor(h.ledger.connection_id(), 0).await;
        assert_eq!(h.reconciler.poll_once().await.unwrap(), 0);
        assert_eq!(h.store.events_for(record.id).await.len(), 2);
    }

    #[tokio::test]
    async fn test_fold_repairs_batch_that_died_after_append() {
        let h = harness();
        let record = h.store.create(&agreement()).await.unwrap();
        fund_on_ledger(&h, record.id).await;

        // A prior round recorded every audit row, then died before any
        // fold landed; the cursor was never advanced.
        let head = h.ledger.head_block().await.unwrap();
        for sealed in h.ledger.events_in_range(1, head).await.unwrap() {
            h.store
                .append_event(
                    record.id,
                    sealed.event.name(),
                    EventCause::Ledger,
                    serde_json::to_value(&sealed.event).unwrap(),
                    Some(sealed.tx_hash.clone()),
                    Some(sealed.block_number),
                    Some(sealed.log_index),
                )
                .await
                .unwrap();
        }

        // The replayed batch dedupes every row but must still bring the
        // record up to the ledger's state.
        let applied = h.reconciler.poll_once().await.unwrap();
        assert_eq!(applied, 0);

        let record = h.store.get(record.id).await.unwrap();
        assert_eq!(record.state, RecordState::Funded);
        assert!(record.is_confirmed);
        assert_eq!(h.store.events_for(record.id).await.len(), 2);
    }

    #[tokio::test]
    async fn test_sweep_skips_reverted_refunds() {
        let h = harness(); // 30-day ledger deadline
        let record = h.store.create(&agreement()).await.unwrap();
        fund_on_ledger(&h, record.id).await;
        h.reconciler.poll_once().await.unwrap();

        // Local deadline drifted ahead of the ledger's; the submission
        // reverts and must not count as a refund.
        h.store
            .update_fields(
                record.id,
                Box::new(|r| r.timeout_at = Some(Utc::now() - chrono::Duration::hours(1))),
            )
            .await
            .unwrap();

        assert_eq!(h.reconciler.sweep_timeouts("0xanyone").await.unwrap(), 0);
        h.reconciler.poll_once().await.unwrap();

        let record = h.store.get(record.id).await.unwrap();
        assert_eq!(record.state, RecordState::Funded);
        assert_eq!(h.ledger.balance_of("0xbuyer").await, 9 * ETH);
    }

    #[tokio::test]
    async fn test_dispute_and_resolution_fold() {
        let h = harness();
        let record = h.store.create(&agreement()).await.unwrap();
        let trade_id = fund_on_ledger(&h, record.id).await;
        h.reconciler.poll_once().await.unwrap();

        h.ledger
            .raise_dispute("0xbuyer", trade_id, "never delivered")
            .await
            .unwrap();
        h.reconciler.poll_once().await.unwrap();
        let disputed = h.store.get(record.id).await.unwrap();
        assert_eq!(disputed.state, RecordState::Disputed);
        assert_eq!(disputed.dispute_reason.as_deref(), Some("never delivered"));

        h.ledger
            .resolve_dispute("0xadmin", trade_id, "0xbuyer", ETH, "full refund")
            .await
            .unwrap();
        h.reconciler.poll_once().await.unwrap();
        let resolved = h.store.get(record.id).await.unwrap();
        assert_eq!(resolved.state, RecordState::Complete);
        assert_eq!(resolved.resolution_note.as_deref(), Some("full refund"));
    }

    #[tokio::test]
    async fn test_foreign_trades_ignored() {
        let h = harness();
        let record = h.store.create(&agreement()).await.unwrap();

        // A trade funded outside this platform, no escrow_id metadata.
        h.ledger.credit("0xother", 2 * ETH).await;
        h.ledger
            .create_and_fund("0xother", "0xelse", ETH, "{}")
            .await
            .unwrap();

        assert_eq!(h.reconciler.poll_once().await.unwrap(), 0);
        let record = h.store.get(record.id).await.unwrap();
        assert_eq!(record.state, RecordState::AwaitingFund);
        assert!(record.trade_id.is_none());
    }

    #[tokio::test]
    async fn test_echo_confirms_provisional_funded_write() {
        let h = harness();
        let record = h.store.create(&agreement()).await.unwrap();
        let trade_id = fund_on_ledger(&h, record.id).await;

        // A coordinator already wrote Funded provisionally, unconfirmed.
        h.store
            .update_state(
                record.id,
                RecordState::AwaitingFund,
                RecordState::Funded,
                Some(Box::new(move |r| r.trade_id = Some(trade_id))),
            )
            .await
            .unwrap();

        h.reconciler.poll_once().await.unwrap();
        let record = h.store.get(record.id).await.unwrap();
        assert_eq!(record.state, RecordState::Funded);
        assert!(record.is_confirmed);
    }

    #[tokio::test]
    async fn test_halted_record_keeps_audit_but_not_state() {
        let h = harness();
        let record = h.store.create(&agreement()).await.unwrap();
        fund_on_ledger(&h, record.id).await;
        h.store.halt(record.id, "manual review").await.unwrap();

        // The batch survives; rows are recorded; state stays put.
        h.reconciler.poll_once().await.unwrap();
        let record = h.store.get(record.id).await.unwrap();
        assert_eq!(record.state, RecordState::AwaitingFund);
        assert_eq!(h.store.events_for(record.id).await.len(), 2);
    }

    #[tokio::test]
    async fn test_delivery_closes_record() {
        let h = harness();
        let record = h.store.create(&agreement()).await.unwrap();
        let trade_id = fund_on_ledger(&h, record.id).await;
        h.reconciler.poll_once().await.unwrap();

        h.ledger.confirm_delivery("0xseller", trade_id).await.unwrap();
        h.reconciler.poll_once().await.unwrap();

        let record = h.store.get(record.id).await.unwrap();
        assert_eq!(record.state, RecordState::Complete);
        assert!(record.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_timeout_sweep_refunds_and_closes() {
        let h = harness_with(LedgerConfig {
            default_timeout_secs: 0,
            ..LedgerConfig::default()
        });
        let record = h.store.create(&agreement()).await.unwrap();
        fund_on_ledger(&h, record.id).await;
        h.reconciler.poll_once().await.unwrap();

        let submitted = h.reconciler.sweep_timeouts("0xanyone").await.unwrap();
        assert_eq!(submitted, 1);
        h.reconciler.poll_once().await.unwrap();

        let record = h.store.get(record.id).await.unwrap();
        assert_eq!(record.state, RecordState::Complete);
        assert_eq!(h.ledger.balance_of("0xbuyer").await, 10 * ETH);
    }
}
