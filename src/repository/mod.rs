pub mod database;
pub mod sqlite_store;

pub use database::Database;
pub use sqlite_store::SqliteLedgerStore;

use crate::types::{AccountBalance, BalanceEvent, BlockRef, EventKey, NotificationTask};
use alloy_primitives::B256;
use anyhow::Result;

/// Everything the ledger needs to resume after a restart.
#[derive(Debug, Default)]
pub struct LedgerState {
    /// Last confirmed block, if any.
    pub cursor: Option<(u64, B256)>,
    /// Recently accepted block refs, ascending. This is the reorg lookback
    /// window; anything older cannot be rolled back and is pruned.
    pub recent_blocks: Vec<BlockRef>,
    pub accounts: Vec<AccountBalance>,
    /// Applied idempotency keys within the window, with their block number.
    pub applied: Vec<(EventKey, u64)>,
    /// Tasks persisted but not yet delivered; re-enqueued on startup.
    pub pending_tasks: Vec<NotificationTask>,
}

/// Durable storage behind the balance ledger.
///
/// `persist_block` and `rollback_block` must each be atomic: an event and
/// its notification task land together or not at all, so a partial failure
/// leaves the previous consistent state and the block can be retried whole.
pub trait LedgerStore: Send + Sync {
    fn load(&self) -> Result<LedgerState>;

    /// Persist one applied block: its ref, fresh events, the resulting
    /// balances, their notification tasks and the advanced cursor, in a
    /// single transaction. Rows older than `prune_below` are dropped.
    fn persist_block(
        &self,
        block: &BlockRef,
        events: &[BalanceEvent],
        balances: &[AccountBalance],
        tasks: &[NotificationTask],
        prune_below: u64,
    ) -> Result<()>;

    /// Applied events of one block, in application order.
    fn events_for_block(&self, block_hash: B256) -> Result<Vec<BalanceEvent>>;

    /// Undo one block: delete its events, block row and undelivered tasks,
    /// restore the given balances and move the cursor to the parent, in a
    /// single transaction.
    fn rollback_block(&self, block: &BlockRef, balances: &[AccountBalance]) -> Result<()>;

    fn mark_task_delivered(&self, key: &EventKey) -> Result<()>;

    fn mark_task_dead_letter(&self, key: &EventKey) -> Result<()>;

    fn dead_letter_count(&self) -> Result<u64>;
}
