//! Escrow record store - durable local mirror of trade lifecycles
//!
//! Source of truth for everything the rest of the platform queries.
//! Every state write goes through the optimistic expected-prior-state
//! check so concurrent writers fail cleanly instead of losing updates,
//! and the event log is append-only with a `(tx_hash, log_index)`
//! idempotence key so replayed ledger events insert exactly once.

use crate::{
    EscrowResult,
    error::EscrowError,
    models::{AgreementRef, EscrowEventRow, EscrowRecord, EventCause, RecordState},
};
use chrono::{DateTime, Utc};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Mutation applied alongside a successful state transition
type RecordMutation = Box<dyn FnOnce(&mut EscrowRecord) + Send>;

/// Store for escrow records, their event log, and reconciler cursors
pub struct RecordStore {
    records: Arc<RwLock<HashMap<Uuid, EscrowRecord>>>,
    events: Arc<RwLock<Vec<EscrowEventRow>>>,
    /// Idempotence key set for ledger-sourced event rows
    seen_ledger_events: Arc<RwLock<HashSet<(String, u32)>>>,
    /// Last fully-processed block per ledger connection
    cursors: Arc<RwLock<HashMap<String, u64>>>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            events: Arc::new(RwLock::new(Vec::new())),
            seen_ledger_events: Arc::new(RwLock::new(HashSet::new())),
            cursors: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create a record for a negotiated agreement. One escrow per agreement.
    pub async fn create(&self, agreement: &AgreementRef) -> EscrowResult<EscrowRecord> {
        if agreement.agreed_amount_wei == 0 {
            return Err(EscrowError::validation("agreed amount is zero"));
        }
        if agreement.buyer == agreement.seller {
            return Err(EscrowError::validation("buyer and seller are the same party"));
        }

        let mut records = self.records.write().await;
        if records
            .values()
            .any(|r| r.agreement_id == agreement.agreement_id)
        {
            return Err(EscrowError::validation(format!(
                "escrow already exists for agreement {}",
                agreement.agreement_id
            )));
        }

        let record = EscrowRecord::new(agreement);
        records.insert(record.id, record.clone());
        info!("Created escrow record {} for agreement {}", record.id, agreement.agreement_id);
        Ok(record)
    }

    pub async fn get(&self, escrow_id: Uuid) -> EscrowResult<EscrowRecord> {
        self.records
            .read()
            .await
            .get(&escrow_id)
            .cloned()
            .ok_or_else(|| EscrowError::not_found(format!("escrow {escrow_id} not found")))
    }

    pub async fn get_by_agreement(&self, agreement_id: i64) -> EscrowResult<EscrowRecord> {
        self.records
            .read()
            .await
            .values()
            .find(|r| r.agreement_id == agreement_id)
            .cloned()
            .ok_or_else(|| {
                EscrowError::not_found(format!("no escrow for agreement {agreement_id}"))
            })
    }

    pub async fn get_by_trade_id(&self, trade_id: u64) -> EscrowResult<Option<EscrowRecord>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .find(|r| r.trade_id == Some(trade_id))
            .cloned())
    }

    /// Transition a record with an optimistic prior-state check.
    ///
    /// Fails with [`EscrowError::StateTransition`] when the stored state no
    /// longer matches `expected` (another writer got there first), when the
    /// transition is not in the lattice, or when the record is halted. The
    /// mutation runs only on a successful transition.
    pub async fn update_state(
        &self,
        escrow_id: Uuid,
        expected: RecordState,
        new_state: RecordState,
        mutation: Option<RecordMutation>,
    ) -> EscrowResult<EscrowRecord> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&escrow_id)
            .ok_or_else(|| EscrowError::not_found(format!("escrow {escrow_id} not found")))?;

        if record.state != expected {
            return Err(EscrowError::state_transition(
                record.state.as_str().to_string(),
                new_state.as_str().to_string(),
                format!("expected prior state {}", expected.as_str()),
            ));
        }
        record.validate_transition(new_state)?;

        record.state = new_state;
        record.updated_at = Utc::now();
        match new_state {
            RecordState::Funded => record.funded_at = Some(Utc::now()),
            RecordState::Disputed => record.disputed_at = Some(Utc::now()),
            RecordState::Complete => record.completed_at = Some(Utc::now()),
            _ => {}
        }
        if let Some(mutation) = mutation {
            mutation(record);
        }

        debug!(
            "Escrow {escrow_id}: {} -> {}",
            expected.as_str(),
            new_state.as_str()
        );
        Ok(record.clone())
    }

    /// Apply a field-only mutation without a state transition.
    pub async fn update_fields(
        &self,
        escrow_id: Uuid,
        mutation: RecordMutation,
    ) -> EscrowResult<EscrowRecord> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&escrow_id)
            .ok_or_else(|| EscrowError::not_found(format!("escrow {escrow_id} not found")))?;
        mutation(record);
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    /// Mark a record inconsistent with the ledger. Automated transitions
    /// stop here; only manual intervention proceeds.
    pub async fn halt(&self, escrow_id: Uuid, reason: &str) -> EscrowResult<EscrowRecord> {
        tracing::error!("Halting escrow {escrow_id}: {reason}");
        self.update_fields(escrow_id, Box::new(|r| r.halted = true)).await
    }

    /// Append a row to the audit log.
    ///
    /// Ledger-sourced rows carrying `(tx_hash, log_index)` are deduplicated;
    /// the return value says whether the row was actually inserted.
    pub async fn append_event(
        &self,
        escrow_id: Uuid,
        event_type: &str,
        cause: EventCause,
        payload: serde_json::Value,
        tx_hash: Option<String>,
        block_number: Option<u64>,
        log_index: Option<u32>,
    ) -> EscrowResult<bool> {
        if let (Some(tx), Some(idx)) = (tx_hash.as_ref(), log_index) {
            let mut seen = self.seen_ledger_events.write().await;
            if !seen.insert((tx.clone(), idx)) {
                debug!("Event {tx}:{idx} already recorded for escrow {escrow_id}");
                return Ok(false);
            }
        }

        let mut events = self.events.write().await;
        let id = events.len() as u64 + 1;
        events.push(EscrowEventRow {
            id,
            escrow_id,
            event_type: event_type.to_string(),
            cause,
            payload,
            tx_hash,
            block_number,
            log_index,
            created_at: Utc::now(),
        });
        Ok(true)
    }

    /// All log rows for one escrow, insertion-ordered.
    pub async fn events_for(&self, escrow_id: Uuid) -> Vec<EscrowEventRow> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.escrow_id == escrow_id)
            .cloned()
            .collect()
    }

    /// Records still waiting on funding confirmation since before `cutoff`,
    /// surfaced for timeout-refund eligibility review.
    pub async fn awaiting_confirmation_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Vec<EscrowRecord> {
        self.records
            .read()
            .await
            .values()
            .filter(|r| {
                matches!(
                    r.state,
                    RecordState::AwaitingFund | RecordState::PendingVerification
                ) && r.created_at <= cutoff
                    && !r.is_confirmed
            })
            .cloned()
            .collect()
    }

    /// Escrows a party is buyer or seller of, newest first, optionally
    /// filtered by state.
    pub async fn list_by_party(
        &self,
        party: &str,
        state: Option<RecordState>,
    ) -> Vec<EscrowRecord> {
        let mut records: Vec<EscrowRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| {
                (r.buyer == party || r.seller == party)
                    && state.map(|s| r.state == s).unwrap_or(true)
            })
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    /// Open disputes, oldest first: the administrator's arbitration queue.
    pub async fn list_disputed(&self) -> Vec<EscrowRecord> {
        let mut records: Vec<EscrowRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.state == RecordState::Disputed)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.disputed_at.unwrap_or(r.created_at));
        records
    }

    /// Funded records whose ledger timeout has passed.
    pub async fn timeout_eligible(&self, now: DateTime<Utc>) -> Vec<EscrowRecord> {
        self.records
            .read()
            .await
            .values()
            .filter(|r| {
                r.state == RecordState::Funded
                    && !r.halted
                    && r.timeout_at.map(|t| now >= t).unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Last fully-processed block for a ledger connection (0 when unset).
    pub async fn load_cursor(&self, connection_id: &str) -> u64 {
        self.cursors
            .read()
            .await
            .get(connection_id)
            .copied()
            .unwrap_or(0)
    }

    /// Persist the cursor. Called only after a whole batch is applied.
    pub async fn save_cursor(&self, connection_id: &str, block: u64) {
        self.cursors
            .write()
            .await
            .insert(connection_id.to_string(), block);
    }
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new()
    }
}
