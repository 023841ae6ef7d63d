use crate::error::WatchError;
use crate::rpc::ChainNode;
use crate::types::{Block, BlockRef};
use std::collections::VecDeque;
use tracing::warn;

/// How a candidate block relates to the chain followed so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// The block's parent hash matches the cursor (or nothing has been
    /// processed yet); it can be applied directly.
    Extends,
    /// The node switched to a divergent chain. `orphaned` lists the
    /// previously accepted blocks above the common ancestor, tip first,
    /// exactly in the order they must be rolled back.
    Reorg {
        ancestor: BlockRef,
        orphaned: Vec<BlockRef>,
    },
}

/// Tracks the last confirmed block and a bounded window of recently
/// accepted ancestors. The window is what makes reorg resolution possible
/// without trusting anything but the node's canonical head; a fork point
/// below it requires an operator-verified resync point.
pub struct ChainCursor {
    /// Accepted refs, oldest front, newest back. The back entry is the
    /// cursor position; empty means no block processed yet.
    recent: VecDeque<BlockRef>,
    lookback: u64,
}

impl ChainCursor {
    pub fn new(lookback: u64) -> Self {
        ChainCursor {
            recent: VecDeque::new(),
            lookback,
        }
    }

    /// Rebuild from persisted refs (ascending block number).
    pub fn restore(recent: Vec<BlockRef>, lookback: u64) -> Self {
        ChainCursor {
            recent: recent.into(),
            lookback,
        }
    }

    pub fn position(&self) -> Option<BlockRef> {
        self.recent.back().copied()
    }

    pub fn lookback(&self) -> u64 {
        self.lookback
    }

    /// Decide how `block` relates to the followed chain. Does not move the
    /// cursor: the caller accepts the block after it was applied, or pops
    /// orphans as each rollback lands, so the cursor never runs ahead of
    /// the ledger.
    pub async fn classify(
        &self,
        node: &dyn ChainNode,
        block: &Block,
    ) -> Result<Advance, WatchError> {
        let tip = match self.recent.back() {
            None => return Ok(Advance::Extends),
            Some(tip) => *tip,
        };

        if block.parent_hash == tip.hash {
            return Ok(Advance::Extends);
        }

        warn!(
            "Block {} ({:?}) does not extend tip {} ({:?}), resolving reorg",
            block.number, block.hash, tip.number, tip.hash
        );
        self.find_ancestor(node, block).await
    }

    /// Walk the candidate chain's ancestry backwards until it meets an
    /// accepted ref. Bounded by the oldest remembered block.
    async fn find_ancestor(
        &self,
        node: &dyn ChainNode,
        block: &Block,
    ) -> Result<Advance, WatchError> {
        let oldest = self
            .recent
            .front()
            .map(|r| r.number)
            .unwrap_or(block.number);

        let mut parent_hash = block.parent_hash;
        let mut parent_number = match block.number.checked_sub(1) {
            Some(n) => n,
            None => return Err(WatchError::ReorgTooDeep { lookback: self.lookback }),
        };

        let ancestor = loop {
            if parent_number < oldest {
                return Err(WatchError::ReorgTooDeep { lookback: self.lookback });
            }

            if let Some(known) = self.recent.iter().find(|r| r.number == parent_number) {
                if known.hash == parent_hash {
                    break *known;
                }
            }

            let header = node.header_by_hash(parent_hash).await?;
            parent_hash = header.parent_hash;
            parent_number = match header.number.checked_sub(1) {
                Some(n) => n,
                None => return Err(WatchError::ReorgTooDeep { lookback: self.lookback }),
            };
        };

        let orphaned: Vec<BlockRef> = self
            .recent
            .iter()
            .filter(|r| r.number > ancestor.number)
            .rev()
            .copied()
            .collect();

        Ok(Advance::Reorg { ancestor, orphaned })
    }

    /// Record a block that was fully applied.
    pub fn accept(&mut self, block: BlockRef) {
        self.recent.push_back(block);
        while self.recent.len() as u64 > self.lookback {
            self.recent.pop_front();
        }
    }

    /// Drop the tip after its rollback landed.
    pub fn pop_tip(&mut self) -> Option<BlockRef> {
        self.recent.pop_back()
    }
}
