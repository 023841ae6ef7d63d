use alloy_primitives::{Address, B256};
use thiserror::Error;

/// Errors surfaced by the ingestion pipeline.
///
/// Transient variants are absorbed by the scanner loop with backoff and
/// never escape it; fatal variants halt ingestion and must reach the
/// operator.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("node unavailable: {0}")]
    NodeUnavailable(String),

    #[error("block not found: {0}")]
    BlockNotFound(String),

    #[error("no common ancestor within the last {lookback} accepted blocks")]
    ReorgTooDeep { lookback: u64 },

    #[error(
        "rollback of block {block_hash} expected event {tx_hash} (log index {log_index:?}) for {address} to be applied"
    )]
    InconsistentRollback {
        block_hash: B256,
        tx_hash: B256,
        log_index: Option<u64>,
        address: Address,
    },

    #[error("balance overflow for {address} ({asset})")]
    Overflow { address: Address, asset: String },

    #[error("storage: {0}")]
    Storage(#[source] anyhow::Error),
}

impl WatchError {
    /// Transient errors are retried in place; everything else stops the
    /// loop and requires a verified restart point.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            WatchError::NodeUnavailable(_) | WatchError::BlockNotFound(_) | WatchError::Storage(_)
        )
    }
}
