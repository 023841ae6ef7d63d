use crate::error::WatchError;
use crate::types::{AssetId, BalanceEvent, Block, Log, Transaction};
use alloy::sol;
use alloy::sol_types::SolEvent;
use alloy_primitives::{Address, B256, I256};
use std::collections::HashSet;
use tracing::{debug, warn};

sol! {
    event Transfer(address indexed from, address indexed to, uint256 value);
}

/// Events and counters produced from one block.
#[derive(Debug, Default)]
pub struct Extraction {
    pub events: Vec<BalanceEvent>,
    pub skipped_logs: u64,
}

/// Decodes a block into balance events for a fixed watch snapshot.
///
/// Extraction is pure and repeatable: the same block and the same snapshot
/// always produce the same events, which is what makes replay after a
/// rollback safe.
pub struct EventExtractor {
    tokens: HashSet<Address>,
}

impl EventExtractor {
    pub fn new(tokens: HashSet<Address>) -> Self {
        EventExtractor { tokens }
    }

    pub fn transfer_topic() -> B256 {
        Transfer::SIGNATURE_HASH
    }

    pub fn extract(
        &self,
        block: &Block,
        watched: &HashSet<Address>,
    ) -> Result<Extraction, WatchError> {
        let mut out = Extraction::default();

        for tx in &block.transactions {
            if !tx.success {
                continue;
            }
            self.extract_native(block, tx, watched, &mut out)?;
            for log in &tx.logs {
                self.extract_token(block, tx, log, watched, &mut out)?;
            }
        }

        Ok(out)
    }

    fn extract_native(
        &self,
        block: &Block,
        tx: &Transaction,
        watched: &HashSet<Address>,
        out: &mut Extraction,
    ) -> Result<(), WatchError> {
        if tx.value.is_zero() {
            return Ok(());
        }
        // A self-transfer nets to zero and would collide on its own
        // idempotency key, so it produces nothing.
        if tx.to == Some(tx.from) {
            return Ok(());
        }

        let delta = I256::try_from(tx.value).map_err(|_| WatchError::Overflow {
            address: tx.from,
            asset: AssetId::Ether.encode(),
        })?;

        if watched.contains(&tx.from) {
            out.events.push(BalanceEvent {
                block_number: block.number,
                block_hash: block.hash,
                tx_hash: tx.hash,
                log_index: None,
                address: tx.from,
                asset: AssetId::Ether,
                delta: -delta,
            });
        }
        if let Some(to) = tx.to {
            if watched.contains(&to) {
                out.events.push(BalanceEvent {
                    block_number: block.number,
                    block_hash: block.hash,
                    tx_hash: tx.hash,
                    log_index: None,
                    address: to,
                    asset: AssetId::Ether,
                    delta,
                });
            }
        }
        Ok(())
    }

    fn extract_token(
        &self,
        block: &Block,
        tx: &Transaction,
        log: &Log,
        watched: &HashSet<Address>,
        out: &mut Extraction,
    ) -> Result<(), WatchError> {
        if log.topics.first() != Some(&Transfer::SIGNATURE_HASH) {
            return Ok(());
        }
        if !self.tokens.contains(&log.address) {
            return Ok(());
        }

        let event = match Transfer::decode_raw_log(log.topics.iter().copied(), &log.data) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    "Failed to decode transfer log {} in block {}: {}",
                    log.index, block.number, e
                );
                out.skipped_logs += 1;
                return Ok(());
            }
        };

        if event.from == event.to {
            debug!(
                "Self-transfer in log {} of block {}, nets to zero",
                log.index, block.number
            );
            return Ok(());
        }

        let asset = AssetId::Token(log.address);
        let delta = I256::try_from(event.value).map_err(|_| WatchError::Overflow {
            address: event.from,
            asset: asset.encode(),
        })?;

        if watched.contains(&event.from) {
            out.events.push(BalanceEvent {
                block_number: block.number,
                block_hash: block.hash,
                tx_hash: tx.hash,
                log_index: Some(log.index),
                address: event.from,
                asset,
                delta: -delta,
            });
        }
        if watched.contains(&event.to) {
            out.events.push(BalanceEvent {
                block_number: block.number,
                block_hash: block.hash,
                tx_hash: tx.hash,
                log_index: Some(log.index),
                address: event.to,
                asset,
                delta,
            });
        }
        Ok(())
    }
}
