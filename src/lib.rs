//! Escrow settlement engine for bilateral trades
//!
//! This crate implements the settlement core for a trade marketplace:
//! - an on-ledger escrow contract holding custody of trade value
//! - a durable local mirror of every trade's lifecycle
//! - funding coordination (self-custodial and custodial paths)
//! - transaction verification against a confirmation threshold
//! - event reconciliation from the ledger into the local record
//! - administrative dispute resolution

pub mod config;
pub mod dispute;
pub mod error;
pub mod funding;
pub mod ledger;
pub mod models;
pub mod node;
pub mod notifier;
pub mod reconciler;
pub mod record_store;
pub mod signer;
pub mod verifier;

use error::EscrowError;

/// Result type alias for escrow operations
pub type EscrowResult<T> = Result<T, EscrowError>;

/// Install a global tracing subscriber honoring `RUST_LOG`.
///
/// Intended for binaries and integration tests; calling it twice is a no-op.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
