//! Core data models for the settlement engine
//!
//! This module contains the ledger-side and record-side state machines,
//! the escrow record and its append-only event log, and the type
//! definitions shared across components.

use crate::EscrowResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// On-ledger trade state machine enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeState {
    /// Trade created, waiting for the buyer's value
    AwaitingFund,
    /// Value held in escrow
    Funded,
    /// Reserved state with no transitions in or out
    AwaitingDelivery,
    /// Value released, trade closed
    Complete,
    /// Under administrative arbitration
    Disputed,
}

impl TradeState {
    /// Check if this is a terminal state (no further transitions possible)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

/// One ledger-tracked escrow instance between a buyer and a seller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    /// Monotonically increasing id assigned at creation
    pub id: u64,
    pub buyer: String,
    pub seller: String,
    pub amount_wei: u128,
    pub state: TradeState,
    pub created_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    pub metadata: String,
}

/// Local escrow record state machine enum
///
/// Mirrors [`TradeState`] plus the local-only `PendingVerification`
/// sub-state a record sits in while a submitted funding transaction
/// is being checked against the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordState {
    AwaitingFund,
    PendingVerification,
    Funded,
    Disputed,
    Complete,
}

impl RecordState {
    /// Position in the forward-only lattice. Transitions may only
    /// increase this rank; replayed events landing at or below the
    /// current rank are no-ops.
    pub fn rank(&self) -> u8 {
        match self {
            Self::AwaitingFund => 0,
            Self::PendingVerification => 1,
            Self::Funded => 2,
            Self::Disputed => 3,
            Self::Complete => 4,
        }
    }

    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwaitingFund => "awaiting_fund",
            Self::PendingVerification => "pending_verification",
            Self::Funded => "funded",
            Self::Disputed => "disputed",
            Self::Complete => "complete",
        }
    }

    /// Whether a direct transition to `to` is part of the lattice.
    pub fn can_transition_to(&self, to: RecordState) -> bool {
        matches!(
            (self, to),
            (Self::AwaitingFund, RecordState::PendingVerification)
                | (Self::AwaitingFund, RecordState::Funded)
                | (Self::PendingVerification, RecordState::Funded)
                | (Self::Funded, RecordState::Disputed)
                | (Self::Funded, RecordState::Complete)
                | (Self::Disputed, RecordState::Complete)
        )
    }
}

/// How an escrow is funded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FundingPath {
    /// The payer signs and submits the funding transaction with their own key
    SelfCustodial,
    /// The platform signs and submits on the payer's behalf (trust-reducing fallback)
    Custodial,
}

/// Administrative dispute outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisputeOutcome {
    /// Full amount back to the buyer
    RefundToBuyer,
    /// Full amount to the seller
    PayoutToSeller,
    /// Named amount to a named party, remainder to the other
    PartialSplit,
}

impl DisputeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RefundToBuyer => "refund_to_buyer",
            Self::PayoutToSeller => "payout_to_seller",
            Self::PartialSplit => "partial_split",
        }
    }
}

/// Negotiated agreement reference consumed from the marketplace layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgreementRef {
    pub agreement_id: i64,
    pub buyer: String,
    pub seller: String,
    pub agreed_amount_wei: u128,
}

/// Administrative decision consumed by the dispute resolver
#[derive(Debug, Clone)]
pub struct ResolutionDecision {
    pub escrow_id: Uuid,
    pub outcome: DisputeOutcome,
    /// Required for `PartialSplit`; defaulted for the other outcomes
    pub recipient: Option<String>,
    /// Required for `PartialSplit`; defaulted to the full amount otherwise
    pub amount_wei: Option<u128>,
    pub note: String,
}

/// Local mirror of one trade plus platform-specific metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowRecord {
    /// Local primary key, independent of the ledger trade id
    pub id: Uuid,
    /// Reference to the external negotiated agreement
    pub agreement_id: i64,
    pub buyer: String,
    pub seller: String,
    pub expected_amount_wei: u128,

    /// Ledger trade id, set once the trade exists on-ledger
    pub trade_id: Option<u64>,
    /// Last-known funding transaction reference
    pub funding_tx: Option<String>,

    pub state: RecordState,
    pub funding_path: Option<FundingPath>,

    pub dispute_reason: Option<String>,
    pub resolution: Option<DisputeOutcome>,
    pub resolution_note: Option<String>,

    /// Confirmation tracking for the funding transaction
    pub confirmations: u64,
    pub is_confirmed: bool,

    pub timeout_at: Option<DateTime<Utc>>,

    /// Set on a consistency failure; blocks all automated transitions
    /// until an administrator intervenes
    pub halted: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub funded_at: Option<DateTime<Utc>>,
    pub disputed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl EscrowRecord {
    /// Create a record in `AwaitingFund` from a negotiated agreement.
    pub fn new(agreement: &AgreementRef) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            agreement_id: agreement.agreement_id,
            buyer: agreement.buyer.clone(),
            seller: agreement.seller.clone(),
            expected_amount_wei: agreement.agreed_amount_wei,
            trade_id: None,
            funding_tx: None,
            state: RecordState::AwaitingFund,
            funding_path: None,
            dispute_reason: None,
            resolution: None,
            resolution_note: None,
            confirmations: 0,
            is_confirmed: false,
            timeout_at: None,
            halted: false,
            created_at: now,
            updated_at: now,
            funded_at: None,
            disputed_at: None,
            completed_at: None,
        }
    }

    /// Check if the escrow is still in an active state
    pub fn is_active(&self) -> bool {
        !matches!(self.state, RecordState::Complete)
    }

    /// Validate a state transition against the forward-only lattice.
    pub fn validate_transition(&self, to: RecordState) -> EscrowResult<()> {
        use crate::error::EscrowError;

        if self.halted {
            return Err(EscrowError::consistency(format!(
                "escrow {} is halted pending administrative review",
                self.id
            )));
        }
        if !self.state.can_transition_to(to) {
            return Err(EscrowError::state_transition(
                self.state.as_str().to_string(),
                to.as_str().to_string(),
                "transition not in lattice".to_string(),
            ));
        }
        Ok(())
    }

    /// Derive the permission set for an actor. Computed from current
    /// state, actor identity, and the timeout clock; never stored.
    pub fn permissions_for(&self, actor: &str, now: DateTime<Utc>) -> EscrowPermissions {
        let is_party = actor == self.buyer || actor == self.seller;
        let timed_out = self.timeout_at.map(|t| now >= t).unwrap_or(false);

        EscrowPermissions {
            can_be_funded: !self.halted
                && self.state == RecordState::AwaitingFund
                && actor == self.buyer,
            can_confirm_delivery: !self.halted && self.state == RecordState::Funded && is_party,
            can_raise_dispute: !self.halted && self.state == RecordState::Funded && is_party,
            // Timeout refund is callable by anyone once eligible.
            can_timeout_refund: !self.halted && self.state == RecordState::Funded && timed_out,
        }
    }
}

/// Derived permission set exposed to the marketplace/UI layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowPermissions {
    pub can_be_funded: bool,
    pub can_confirm_delivery: bool,
    pub can_raise_dispute: bool,
    pub can_timeout_refund: bool,
}

/// What caused a local state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventCause {
    /// Replayed from an emitted ledger event
    Ledger,
    /// Local administrative or coordinator action, provisional until
    /// echoed back by reconciliation
    Admin,
}

/// One row of the append-only escrow event log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowEventRow {
    pub id: u64,
    pub escrow_id: Uuid,
    pub event_type: String,
    pub cause: EventCause,
    pub payload: serde_json::Value,
    pub tx_hash: Option<String>,
    pub block_number: Option<u64>,
    pub log_index: Option<u32>,
    pub created_at: DateTime<Utc>,
}

/// Events emitted by the ledger contract, matched exhaustively wherever
/// they are folded into local state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    EscrowCreated {
        trade_id: u64,
        buyer: String,
        seller: String,
        amount_wei: u128,
        metadata: String,
    },
    Funded {
        trade_id: u64,
        payer: String,
        amount_wei: u128,
    },
    DeliveryConfirmed {
        trade_id: u64,
        confirmer: String,
    },
    Released {
        trade_id: u64,
        to: String,
        amount_wei: u128,
        fee_wei: u128,
    },
    Disputed {
        trade_id: u64,
        by: String,
        reason: String,
    },
    Resolved {
        trade_id: u64,
        to: String,
        amount_wei: u128,
        resolution: String,
    },
    TimeoutRefund {
        trade_id: u64,
        buyer: String,
        amount_wei: u128,
    },
}

impl LedgerEvent {
    pub fn trade_id(&self) -> u64 {
        match self {
            Self::EscrowCreated { trade_id, .. }
            | Self::Funded { trade_id, .. }
            | Self::DeliveryConfirmed { trade_id, .. }
            | Self::Released { trade_id, .. }
            | Self::Disputed { trade_id, .. }
            | Self::Resolved { trade_id, .. }
            | Self::TimeoutRefund { trade_id, .. } => *trade_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::EscrowCreated { .. } => "escrow_created",
            Self::Funded { .. } => "funded",
            Self::DeliveryConfirmed { .. } => "delivery_confirmed",
            Self::Released { .. } => "released",
            Self::Disputed { .. } => "disputed",
            Self::Resolved { .. } => "resolved",
            Self::TimeoutRefund { .. } => "timeout_refund",
        }
    }
}

/// A ledger event together with its sealed position in the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedEvent {
    pub event: LedgerEvent,
    pub block_number: u64,
    pub log_index: u32,
    pub tx_hash: String,
}

/// Outcome of a mined transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    Success,
    Reverted,
}

/// Receipt for a submitted ledger transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxReceipt {
    pub tx_hash: String,
    pub block_number: u64,
    pub status: TxStatus,
    pub revert_reason: Option<String>,
    pub events: Vec<SealedEvent>,
}

impl TxReceipt {
    pub fn is_success(&self) -> bool {
        self.status == TxStatus::Success
    }
}
