//! Ledger contract - the on-ledger authority for trade custody
//!
//! This module provides the escrow contract's state machine of record and
//! the [`LedgerConnection`] seam the off-ledger components talk through.
//! The in-process implementation mines one block per submitted transaction,
//! keeps receipts queryable by hash, and emits the event set the reconciler
//! replays. A remote chain client can replace it without touching call sites.

use crate::{
    EscrowResult,
    error::EscrowError,
    models::{LedgerEvent, SealedEvent, Trade, TradeState, TxReceipt, TxStatus},
};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// Hard ceiling on the platform fee: 10%
pub const MAX_FEE_BPS: u16 = 1_000;

/// Configuration for the ledger contract
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Administrator identity (dispute resolution, fee changes)
    pub admin: String,
    /// Recipient of the platform fee on delivery release
    pub fee_recipient: String,
    /// Platform fee in basis points, capped at [`MAX_FEE_BPS`]
    pub fee_bps: u16,
    /// Seconds until a funded trade becomes timeout-refundable
    pub default_timeout_secs: i64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            admin: "0xadmin".to_string(),
            fee_recipient: "0xfees".to_string(),
            fee_bps: 100, // 1%
            default_timeout_secs: 30 * 24 * 3600,
        }
    }
}

/// Wire contract every off-ledger component goes through.
///
/// Mutating calls return the transaction hash whether or not the call
/// reverted; the mined receipt is the only source of truth for outcome.
/// `Err` is reserved for connection-level failures.
#[async_trait]
pub trait LedgerConnection: Send + Sync {
    async fn create_and_fund(
        &self,
        caller: &str,
        seller: &str,
        value_wei: u128,
        metadata: &str,
    ) -> EscrowResult<String>;

    async fn create_trade_without_fund(
        &self,
        caller: &str,
        seller: &str,
        metadata: &str,
    ) -> EscrowResult<String>;

    async fn fund_trade(&self, caller: &str, trade_id: u64, value_wei: u128)
    -> EscrowResult<String>;

    async fn confirm_delivery(&self, caller: &str, trade_id: u64) -> EscrowResult<String>;

    async fn raise_dispute(&self, caller: &str, trade_id: u64, reason: &str)
    -> EscrowResult<String>;

    async fn resolve_dispute(
        &self,
        caller: &str,
        trade_id: u64,
        recipient: &str,
        amount_wei: u128,
        note: &str,
    ) -> EscrowResult<String>;

    async fn timeout_refund(&self, caller: &str, trade_id: u64) -> EscrowResult<String>;

    async fn get_trade(&self, trade_id: u64) -> EscrowResult<Option<Trade>>;

    async fn get_receipt(&self, tx_hash: &str) -> EscrowResult<Option<TxReceipt>>;

    async fn head_block(&self) -> EscrowResult<u64>;

    /// Events in `[from_block, to_block]`, block-and-log ordered
    async fn events_in_range(&self, from_block: u64, to_block: u64)
    -> EscrowResult<Vec<SealedEvent>>;

    /// Stable identifier for cursor tracking
    fn connection_id(&self) -> &str;
}

struct LedgerState {
    trades: HashMap<u64, Trade>,
    next_trade_id: u64,
    /// Account balances, including credits from released escrow value
    balances: HashMap<String, u128>,
    /// Value the contract still holds per trade
    held: HashMap<u64, u128>,
    head_block: u64,
    log: Vec<SealedEvent>,
    receipts: HashMap<String, TxReceipt>,
    fee_bps: u16,
}

impl LedgerState {
    fn begin_tx(&mut self) -> (u64, String) {
        self.head_block += 1;
        let tx_hash = format!("0x{}", Uuid::new_v4().simple());
        (self.head_block, tx_hash)
    }

    fn revert(&mut self, block: u64, tx_hash: String, reason: &str) -> String {
        warn!("Ledger tx {tx_hash} reverted: {reason}");
        self.receipts.insert(
            tx_hash.clone(),
            TxReceipt {
                tx_hash: tx_hash.clone(),
                block_number: block,
                status: TxStatus::Reverted,
                revert_reason: Some(reason.to_string()),
                events: Vec::new(),
            },
        );
        tx_hash
    }

    fn commit(&mut self, block: u64, tx_hash: String, events: Vec<LedgerEvent>) -> String {
        let sealed: Vec<SealedEvent> = events
            .into_iter()
            .enumerate()
            .map(|(i, event)| SealedEvent {
                event,
                block_number: block,
                log_index: i as u32,
                tx_hash: tx_hash.clone(),
            })
            .collect();
        self.log.extend(sealed.iter().cloned());
        self.receipts.insert(
            tx_hash.clone(),
            TxReceipt {
                tx_hash: tx_hash.clone(),
                block_number: block,
                status: TxStatus::Success,
                revert_reason: None,
                events: sealed,
            },
        );
        tx_hash
    }

    fn debit(&mut self, account: &str, amount_wei: u128) -> Result<(), String> {
        let balance = self.balances.get(account).copied().unwrap_or(0);
        if balance < amount_wei {
            return Err(format!("insufficient balance for {account}"));
        }
        self.balances.insert(account.to_string(), balance - amount_wei);
        Ok(())
    }

    fn credit(&mut self, account: &str, amount_wei: u128) {
        *self.balances.entry(account.to_string()).or_insert(0) += amount_wei;
    }

    /// Pay out `amount_wei` of a trade's held value. The held balance is
    /// the invariant: total outgoing per trade can never exceed it.
    fn release(&mut self, trade_id: u64, to: &str, amount_wei: u128) -> Result<(), String> {
        let held = self.held.get(&trade_id).copied().unwrap_or(0);
        if amount_wei > held {
            return Err(format!(
                "release of {amount_wei} exceeds held balance {held} for trade {trade_id}"
            ));
        }
        self.held.insert(trade_id, held - amount_wei);
        self.credit(to, amount_wei);
        Ok(())
    }

    fn validate_parties(caller: &str, seller: &str) -> Result<(), String> {
        if seller.trim().is_empty() {
            return Err("seller is a null identity".to_string());
        }
        if seller == caller {
            return Err("seller equals buyer".to_string());
        }
        Ok(())
    }
}

/// In-process ledger contract implementing [`LedgerConnection`]
pub struct EscrowLedger {
    config: LedgerConfig,
    connection_id: String,
    state: Arc<RwLock<LedgerState>>,
}

impl EscrowLedger {
    pub fn new(config: LedgerConfig) -> Self {
        let fee_bps = config.fee_bps.min(MAX_FEE_BPS);
        Self {
            config,
            connection_id: "in-process".to_string(),
            state: Arc::new(RwLock::new(LedgerState {
                trades: HashMap::new(),
                next_trade_id: 1,
                balances: HashMap::new(),
                held: HashMap::new(),
                head_block: 0,
                log: Vec::new(),
                receipts: HashMap::new(),
                fee_bps,
            })),
        }
    }

    /// Seed an account balance (faucet entry point).
    pub async fn credit(&self, account: &str, amount_wei: u128) {
        self.state.write().await.credit(account, amount_wei);
    }

    pub async fn balance_of(&self, account: &str) -> u128 {
        self.state
            .read()
            .await
            .balances
            .get(account)
            .copied()
            .unwrap_or(0)
    }

    /// Value the contract still holds for a trade.
    pub async fn held_for(&self, trade_id: u64) -> u128 {
        self.state.read().await.held.get(&trade_id).copied().unwrap_or(0)
    }

    /// Mine empty blocks to deepen confirmations.
    pub async fn mine_blocks(&self, n: u64) {
        self.state.write().await.head_block += n;
    }

    /// Adjust the platform fee. Administrator only, capped at [`MAX_FEE_BPS`].
    pub async fn set_fee_bps(&self, caller: &str, fee_bps: u16) -> EscrowResult<()> {
        if caller != self.config.admin {
            return Err(EscrowError::validation("only the administrator may set fees"));
        }
        if fee_bps > MAX_FEE_BPS {
            return Err(EscrowError::validation(format!(
                "fee {fee_bps} bps exceeds ceiling {MAX_FEE_BPS}"
            )));
        }
        self.state.write().await.fee_bps = fee_bps;
        Ok(())
    }

    fn timeout_from_now(&self) -> chrono::DateTime<Utc> {
        Utc::now() + Duration::seconds(self.config.default_timeout_secs)
    }
}

#[async_trait]
impl LedgerConnection for EscrowLedger {
    async fn create_and_fund(
        &self,
        caller: &str,
        seller: &str,
        value_wei: u128,
        metadata: &str,
    ) -> EscrowResult<String> {
        let mut s = self.state.write().await;
        let (block, tx_hash) = s.begin_tx();

        if let Err(reason) = LedgerState::validate_parties(caller, seller) {
            return Ok(s.revert(block, tx_hash, &reason));
        }
        if value_wei == 0 {
            return Ok(s.revert(block, tx_hash, "amount is zero"));
        }
        if let Err(reason) = s.debit(caller, value_wei) {
            return Ok(s.revert(block, tx_hash, &reason));
        }

        let trade_id = s.next_trade_id;
        s.next_trade_id += 1;
        let trade = Trade {
            id: trade_id,
            buyer: caller.to_string(),
            seller: seller.to_string(),
            amount_wei: value_wei,
            state: TradeState::Funded,
            created_at: Utc::now(),
            timeout_at: self.timeout_from_now(),
            metadata: metadata.to_string(),
        };
        s.trades.insert(trade_id, trade);
        s.held.insert(trade_id, value_wei);

        info!("Created and funded trade {trade_id} for {value_wei} wei");
        Ok(s.commit(
            block,
            tx_hash,
            vec![
                LedgerEvent::EscrowCreated {
                    trade_id,
                    buyer: caller.to_string(),
                    seller: seller.to_string(),
                    amount_wei: value_wei,
                    metadata: metadata.to_string(),
                },
                LedgerEvent::Funded {
                    trade_id,
                    payer: caller.to_string(),
                    amount_wei: value_wei,
                },
            ],
        ))
    }

    async fn create_trade_without_fund(
        &self,
        caller: &str,
        seller: &str,
        metadata: &str,
    ) -> EscrowResult<String> {
        let mut s = self.state.write().await;
        let (block, tx_hash) = s.begin_tx();

        if let Err(reason) = LedgerState::validate_parties(caller, seller) {
            return Ok(s.revert(block, tx_hash, &reason));
        }

        let trade_id = s.next_trade_id;
        s.next_trade_id += 1;
        s.trades.insert(
            trade_id,
            Trade {
                id: trade_id,
                buyer: caller.to_string(),
                seller: seller.to_string(),
                amount_wei: 0,
                state: TradeState::AwaitingFund,
                created_at: Utc::now(),
                timeout_at: self.timeout_from_now(),
                metadata: metadata.to_string(),
            },
        );

        info!("Created pending trade {trade_id}");
        Ok(s.commit(
            block,
            tx_hash,
            vec![LedgerEvent::EscrowCreated {
                trade_id,
                buyer: caller.to_string(),
                seller: seller.to_string(),
                amount_wei: 0,
                metadata: metadata.to_string(),
            }],
        ))
    }

    async fn fund_trade(
        &self,
        caller: &str,
        trade_id: u64,
        value_wei: u128,
    ) -> EscrowResult<String> {
        let mut s = self.state.write().await;
        let (block, tx_hash) = s.begin_tx();

        let Some(trade) = s.trades.get(&trade_id).cloned() else {
            return Ok(s.revert(block, tx_hash, "unknown trade"));
        };
        if trade.buyer != caller {
            return Ok(s.revert(block, tx_hash, "only the original buyer may fund"));
        }
        if trade.state != TradeState::AwaitingFund {
            return Ok(s.revert(block, tx_hash, "trade is not awaiting funding"));
        }
        if value_wei == 0 {
            return Ok(s.revert(block, tx_hash, "amount is zero"));
        }
        if let Err(reason) = s.debit(caller, value_wei) {
            return Ok(s.revert(block, tx_hash, &reason));
        }

        let timeout_at = self.timeout_from_now();
        if let Some(trade) = s.trades.get_mut(&trade_id) {
            trade.amount_wei = value_wei;
            trade.state = TradeState::Funded;
            trade.timeout_at = timeout_at;
        }
        s.held.insert(trade_id, value_wei);

        info!("Funded trade {trade_id} with {value_wei} wei");
        Ok(s.commit(
            block,
            tx_hash,
            vec![LedgerEvent::Funded {
                trade_id,
                payer: caller.to_string(),
                amount_wei: value_wei,
            }],
        ))
    }

    async fn confirm_delivery(&self, caller: &str, trade_id: u64) -> EscrowResult<String> {
        let mut s = self.state.write().await;
        let (block, tx_hash) = s.begin_tx();

        let Some(trade) = s.trades.get(&trade_id).cloned() else {
            return Ok(s.revert(block, tx_hash, "unknown trade"));
        };
        if caller != trade.buyer && caller != trade.seller {
            return Ok(s.revert(block, tx_hash, "only buyer or seller may confirm delivery"));
        }
        if trade.state != TradeState::Funded {
            return Ok(s.revert(block, tx_hash, "trade is not funded"));
        }

        let fee_wei = trade.amount_wei * u128::from(s.fee_bps) / 10_000;
        let payout_wei = trade.amount_wei - fee_wei;

        // Both transfers succeed or the whole call reverts.
        if let Err(reason) = s.release(trade_id, &trade.seller, payout_wei) {
            return Ok(s.revert(block, tx_hash, &reason));
        }
        let fee_recipient = self.config.fee_recipient.clone();
        if fee_wei > 0 {
            if let Err(reason) = s.release(trade_id, &fee_recipient, fee_wei) {
                return Ok(s.revert(block, tx_hash, &reason));
            }
        }

        if let Some(trade) = s.trades.get_mut(&trade_id) {
            trade.state = TradeState::Complete;
        }

        info!("Trade {trade_id} delivery confirmed; released {payout_wei} wei (fee {fee_wei})");
        Ok(s.commit(
            block,
            tx_hash,
            vec![
                LedgerEvent::DeliveryConfirmed {
                    trade_id,
                    confirmer: caller.to_string(),
                },
                LedgerEvent::Released {
                    trade_id,
                    to: trade.seller.clone(),
                    amount_wei: payout_wei,
                    fee_wei,
                },
            ],
        ))
    }

    async fn raise_dispute(
        &self,
        caller: &str,
        trade_id: u64,
        reason: &str,
    ) -> EscrowResult<String> {
        let mut s = self.state.write().await;
        let (block, tx_hash) = s.begin_tx();

        let Some(trade) = s.trades.get(&trade_id).cloned() else {
            return Ok(s.revert(block, tx_hash, "unknown trade"));
        };
        if caller != trade.buyer && caller != trade.seller {
            return Ok(s.revert(block, tx_hash, "only buyer or seller may raise a dispute"));
        }
        if trade.state != TradeState::Funded {
            return Ok(s.revert(block, tx_hash, "trade is not funded"));
        }

        if let Some(trade) = s.trades.get_mut(&trade_id) {
            trade.state = TradeState::Disputed;
        }

        info!("Trade {trade_id} disputed by {caller}");
        Ok(s.commit(
            block,
            tx_hash,
            vec![LedgerEvent::Disputed {
                trade_id,
                by: caller.to_string(),
                reason: reason.to_string(),
            }],
        ))
    }

    async fn resolve_dispute(
        &self,
        caller: &str,
        trade_id: u64,
        recipient: &str,
        amount_wei: u128,
        note: &str,
    ) -> EscrowResult<String> {
        let mut s = self.state.write().await;
        let (block, tx_hash) = s.begin_tx();

        if caller != self.config.admin {
            return Ok(s.revert(block, tx_hash, "only the administrator may resolve"));
        }
        let Some(trade) = s.trades.get(&trade_id).cloned() else {
            return Ok(s.revert(block, tx_hash, "unknown trade"));
        };
        if trade.state != TradeState::Disputed {
            return Ok(s.revert(block, tx_hash, "trade is not disputed"));
        }
        if recipient != trade.buyer && recipient != trade.seller {
            return Ok(s.revert(block, tx_hash, "recipient must be buyer or seller"));
        }
        if amount_wei > trade.amount_wei {
            return Ok(s.revert(block, tx_hash, "amount exceeds trade amount"));
        }

        let other = if recipient == trade.buyer {
            trade.seller.clone()
        } else {
            trade.buyer.clone()
        };
        let remainder_wei = trade.amount_wei - amount_wei;

        if let Err(reason) = s.release(trade_id, recipient, amount_wei) {
            return Ok(s.revert(block, tx_hash, &reason));
        }
        if remainder_wei > 0 {
            if let Err(reason) = s.release(trade_id, &other, remainder_wei) {
                return Ok(s.revert(block, tx_hash, &reason));
            }
        }

        if let Some(trade) = s.trades.get_mut(&trade_id) {
            trade.state = TradeState::Complete;
        }

        let mut events = vec![LedgerEvent::Resolved {
            trade_id,
            to: recipient.to_string(),
            amount_wei,
            resolution: note.to_string(),
        }];
        if remainder_wei > 0 {
            events.push(LedgerEvent::Resolved {
                trade_id,
                to: other,
                amount_wei: remainder_wei,
                resolution: "remainder".to_string(),
            });
        }

        info!("Trade {trade_id} resolved: {amount_wei} wei to {recipient}");
        Ok(s.commit(block, tx_hash, events))
    }

    async fn timeout_refund(&self, caller: &str, trade_id: u64) -> EscrowResult<String> {
        let mut s = self.state.write().await;
        let (block, tx_hash) = s.begin_tx();

        let Some(trade) = s.trades.get(&trade_id).cloned() else {
            return Ok(s.revert(block, tx_hash, "unknown trade"));
        };
        if trade.state != TradeState::Funded {
            return Ok(s.revert(block, tx_hash, "trade is not funded"));
        }
        if Utc::now() < trade.timeout_at {
            return Ok(s.revert(block, tx_hash, "trade has not timed out"));
        }

        if let Err(reason) = s.release(trade_id, &trade.buyer, trade.amount_wei) {
            return Ok(s.revert(block, tx_hash, &reason));
        }
        if let Some(trade) = s.trades.get_mut(&trade_id) {
            trade.state = TradeState::Complete;
        }

        info!("Trade {trade_id} timed out; {} wei refunded to buyer (by {caller})", trade.amount_wei);
        Ok(s.commit(
            block,
            tx_hash,
            vec![LedgerEvent::TimeoutRefund {
                trade_id,
                buyer: trade.buyer.clone(),
                amount_wei: trade.amount_wei,
            }],
        ))
    }

    async fn get_trade(&self, trade_id: u64) -> EscrowResult<Option<Trade>> {
        Ok(self.state.read().await.trades.get(&trade_id).cloned())
    }

    async fn get_receipt(&self, tx_hash: &str) -> EscrowResult<Option<TxReceipt>> {
        Ok(self.state.read().await.receipts.get(tx_hash).cloned())
    }

    async fn head_block(&self) -> EscrowResult<u64> {
        Ok(self.state.read().await.head_block)
    }

    async fn events_in_range(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> EscrowResult<Vec<SealedEvent>> {
        let s = self.state.read().await;
        let mut events: Vec<SealedEvent> = s
            .log
            .iter()
            .filter(|e| e.block_number >= from_block && e.block_number <= to_block)
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.block_number, e.log_index));
        Ok(events)
    }

    fn connection_id(&self) -> &str {
        &self.connection_id
    }
}
