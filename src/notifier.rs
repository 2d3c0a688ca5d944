//! Notification sink for escrow lifecycle changes
//!
//! The reconciler and dispute resolver publish state changes through the
//! [`NotificationSink`] seam so marketplace-facing delivery (webhooks,
//! relays, in-app feeds) stays out of the settlement path.

use crate::EscrowResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

/// One lifecycle notice, self-contained for out-of-process delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowNotice {
    pub escrow_id: Uuid,
    /// Snake-case event name, matching the audit log rows
    pub event: String,
    pub state: String,
    pub detail: serde_json::Value,
}

/// Delivery seam for lifecycle notices
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, notice: EscrowNotice) -> EscrowResult<()>;
}

/// Default sink: structured log lines only
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn publish(&self, notice: EscrowNotice) -> EscrowResult<()> {
        info!(
            "Escrow {} notice: {} (state {})",
            notice.escrow_id, notice.event, notice.state
        );
        Ok(())
    }
}

/// Sink backed by an unbounded channel, for embedding and for tests
pub struct ChannelNotifier {
    sender: mpsc::UnboundedSender<EscrowNotice>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EscrowNotice>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl NotificationSink for ChannelNotifier {
    async fn publish(&self, notice: EscrowNotice) -> EscrowResult<()> {
        // A dropped receiver is fine; notices are best-effort.
        let _ = self.sender.send(notice);
        Ok(())
    }
}
