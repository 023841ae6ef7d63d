use crate::error::WatchError;
use crate::repository::{LedgerState, LedgerStore};
use crate::types::{AccountBalance, AssetId, BalanceEvent, BlockRef, EventKey, NotificationTask};
use alloy_primitives::{Address, I256};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

type AccountMap = HashMap<(Address, AssetId), AccountBalance>;

/// Authoritative balance view.
///
/// Strictly single-writer: all mutation goes through `apply`/`rollback` on
/// the one owner (the scanner). Reads share the account map through
/// [`LedgerReader`] and only ever hold the lock for a single lookup, so
/// they observe either the state before a block or after it, never a
/// half-applied one.
pub struct BalanceLedger {
    store: Arc<dyn LedgerStore>,
    accounts: Arc<RwLock<AccountMap>>,
    /// Applied idempotency keys within the lookback window, keyed to their
    /// block number for pruning.
    applied: HashMap<EventKey, u64>,
    lookback: u64,
}

/// Cheap cloneable read handle, safe to hand to API servers and tests
/// while ingestion keeps running.
#[derive(Clone)]
pub struct LedgerReader {
    accounts: Arc<RwLock<AccountMap>>,
}

impl LedgerReader {
    pub fn balance_of(&self, address: Address, asset: AssetId) -> I256 {
        self.accounts
            .read()
            .expect("ledger lock poisoned")
            .get(&(address, asset))
            .map(|account| account.balance)
            .unwrap_or(I256::ZERO)
    }

    pub fn account(&self, address: Address, asset: AssetId) -> Option<AccountBalance> {
        self.accounts
            .read()
            .expect("ledger lock poisoned")
            .get(&(address, asset))
            .cloned()
    }
}

impl BalanceLedger {
    pub fn new(store: Arc<dyn LedgerStore>, lookback: u64) -> Self {
        BalanceLedger {
            store,
            accounts: Arc::new(RwLock::new(HashMap::new())),
            applied: HashMap::new(),
            lookback,
        }
    }

    /// Rebuild the in-memory view from persisted state.
    pub fn restore(store: Arc<dyn LedgerStore>, state: &LedgerState, lookback: u64) -> Self {
        let accounts: AccountMap = state
            .accounts
            .iter()
            .map(|account| ((account.address, account.asset), account.clone()))
            .collect();
        let applied = state.applied.iter().copied().collect();

        BalanceLedger {
            store,
            accounts: Arc::new(RwLock::new(accounts)),
            applied,
            lookback,
        }
    }

    pub fn reader(&self) -> LedgerReader {
        LedgerReader {
            accounts: Arc::clone(&self.accounts),
        }
    }

    pub fn balance_of(&self, address: Address, asset: AssetId) -> I256 {
        self.reader().balance_of(address, asset)
    }

    /// Apply one block's events. Idempotent per event: keys seen before are
    /// skipped silently, which is what makes retrying a partially persisted
    /// block safe.
    ///
    /// Balances are staged first, persisted together with the events, the
    /// notification tasks and the advanced cursor in one storage
    /// transaction, and only then published to the shared map. A failed
    /// persist therefore leaves no trace and the whole block is retried.
    pub fn apply(
        &mut self,
        events: &[BalanceEvent],
        block: &BlockRef,
    ) -> Result<Vec<NotificationTask>, WatchError> {
        let mut staged: AccountMap = HashMap::new();
        let mut fresh: Vec<BalanceEvent> = Vec::new();
        let mut tasks: Vec<NotificationTask> = Vec::new();

        for event in events {
            let key = event.key();
            if self.applied.contains_key(&key) {
                debug!(
                    "Event {:?}/{:?} already applied, skipping",
                    event.tx_hash, event.log_index
                );
                continue;
            }

            let slot = (event.address, event.asset);
            let current = match staged.get(&slot) {
                Some(account) => account.balance,
                None => self
                    .accounts
                    .read()
                    .expect("ledger lock poisoned")
                    .get(&slot)
                    .map(|account| account.balance)
                    .unwrap_or(I256::ZERO),
            };

            let balance = current
                .checked_add(event.delta)
                .ok_or_else(|| WatchError::Overflow {
                    address: event.address,
                    asset: event.asset.encode(),
                })?;

            staged.insert(
                slot,
                AccountBalance {
                    address: event.address,
                    asset: event.asset,
                    balance,
                    last_block: block.number,
                    last_hash: block.hash,
                },
            );
            fresh.push(event.clone());
            tasks.push(NotificationTask {
                address: event.address,
                asset: event.asset,
                delta: event.delta,
                new_balance: balance,
                key,
                attempts: 0,
            });
        }

        let balances: Vec<AccountBalance> = staged.values().cloned().collect();
        let prune_below = block.number.saturating_sub(self.lookback);
        self.store
            .persist_block(block, &fresh, &balances, &tasks, prune_below)
            .map_err(WatchError::Storage)?;

        {
            let mut accounts = self.accounts.write().expect("ledger lock poisoned");
            for account in balances {
                accounts.insert((account.address, account.asset), account);
            }
        }
        for event in &fresh {
            self.applied.insert(event.key(), event.block_number);
        }
        self.applied.retain(|_, number| *number >= prune_below);

        if !fresh.is_empty() {
            info!(
                "Applied {} events in block {} ({} accounts touched)",
                fresh.len(),
                block.number,
                tasks.len()
            );
        }
        Ok(tasks)
    }

    /// Reverse every event of one orphaned block, tip first. An event the
    /// store reports but the applied set does not know signals an internal
    /// bug; that is never auto-healed.
    pub fn rollback(&mut self, block: &BlockRef) -> Result<(), WatchError> {
        let events = self
            .store
            .events_for_block(block.hash)
            .map_err(WatchError::Storage)?;

        let parent_number = block.number.saturating_sub(1);
        let mut staged: AccountMap = HashMap::new();

        for event in events.iter().rev() {
            let key = event.key();
            if !self.applied.contains_key(&key) {
                return Err(WatchError::InconsistentRollback {
                    block_hash: event.block_hash,
                    tx_hash: event.tx_hash,
                    log_index: event.log_index,
                    address: event.address,
                });
            }

            let slot = (event.address, event.asset);
            let current = match staged.get(&slot) {
                Some(account) => Some(account.balance),
                None => self
                    .accounts
                    .read()
                    .expect("ledger lock poisoned")
                    .get(&slot)
                    .map(|account| account.balance),
            };
            let current = current.ok_or_else(|| WatchError::InconsistentRollback {
                block_hash: event.block_hash,
                tx_hash: event.tx_hash,
                log_index: event.log_index,
                address: event.address,
            })?;

            let balance = current
                .checked_sub(event.delta)
                .ok_or_else(|| WatchError::Overflow {
                    address: event.address,
                    asset: event.asset.encode(),
                })?;

            staged.insert(
                slot,
                AccountBalance {
                    address: event.address,
                    asset: event.asset,
                    balance,
                    last_block: parent_number,
                    last_hash: block.parent_hash,
                },
            );
        }

        let balances: Vec<AccountBalance> = staged.values().cloned().collect();
        self.store
            .rollback_block(block, &balances)
            .map_err(WatchError::Storage)?;

        {
            let mut accounts = self.accounts.write().expect("ledger lock poisoned");
            for account in balances {
                accounts.insert((account.address, account.asset), account);
            }
        }
        for event in &events {
            self.applied.remove(&event.key());
        }

        info!(
            "Rolled back {} events of orphaned block {} ({:?})",
            events.len(),
            block.number,
            block.hash
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{Database, SqliteLedgerStore};
    use alloy_primitives::B256;

    fn hash(tag: u8) -> B256 {
        B256::with_last_byte(tag)
    }

    fn addr(tag: u8) -> Address {
        Address::with_last_byte(tag)
    }

    fn block_ref(number: u64, tag: u8, parent_tag: u8) -> BlockRef {
        BlockRef {
            number,
            hash: hash(tag),
            parent_hash: hash(parent_tag),
        }
    }

    fn event(block: &BlockRef, tx_tag: u8, address: Address, delta: i64) -> BalanceEvent {
        BalanceEvent {
            block_number: block.number,
            block_hash: block.hash,
            tx_hash: hash(tx_tag),
            log_index: None,
            address,
            asset: AssetId::Ether,
            delta: I256::try_from(delta).unwrap(),
        }
    }

    fn new_ledger() -> BalanceLedger {
        let store = Arc::new(SqliteLedgerStore::new(Database::in_memory().unwrap()));
        BalanceLedger::new(store, 64)
    }

    #[test]
    fn balances_equal_the_sum_of_applied_deltas() {
        let mut ledger = new_ledger();
        let b100 = block_ref(100, 10, 9);
        let b101 = block_ref(101, 11, 10);

        ledger
            .apply(
                &[event(&b100, 1, addr(1), 5), event(&b100, 2, addr(1), 3)],
                &b100,
            )
            .unwrap();
        ledger.apply(&[event(&b101, 3, addr(1), -2)], &b101).unwrap();

        assert_eq!(
            ledger.balance_of(addr(1), AssetId::Ether),
            I256::try_from(6).unwrap()
        );
    }

    #[test]
    fn applying_a_block_twice_changes_nothing() {
        let mut ledger = new_ledger();
        let block = block_ref(100, 10, 9);
        let events = vec![event(&block, 1, addr(1), 5)];

        let first = ledger.apply(&events, &block).unwrap();
        let second = ledger.apply(&events, &block).unwrap();

        assert_eq!(first.len(), 1);
        assert!(second.is_empty(), "retried events must not emit tasks");
        assert_eq!(
            ledger.balance_of(addr(1), AssetId::Ether),
            I256::try_from(5).unwrap()
        );
    }

    #[test]
    fn rollback_then_reapply_is_a_no_op() {
        let mut ledger = new_ledger();
        let block = block_ref(100, 10, 9);
        let events = vec![
            event(&block, 1, addr(1), 5),
            event(&block, 2, addr(2), -3),
        ];

        ledger.apply(&events, &block).unwrap();
        ledger.rollback(&block).unwrap();

        assert_eq!(ledger.balance_of(addr(1), AssetId::Ether), I256::ZERO);
        assert_eq!(ledger.balance_of(addr(2), AssetId::Ether), I256::ZERO);

        ledger.apply(&events, &block).unwrap();
        assert_eq!(
            ledger.balance_of(addr(1), AssetId::Ether),
            I256::try_from(5).unwrap()
        );
        assert_eq!(
            ledger.balance_of(addr(2), AssetId::Ether),
            I256::try_from(-3).unwrap()
        );
    }

    #[test]
    fn multiple_assets_are_tracked_independently() {
        let mut ledger = new_ledger();
        let block = block_ref(100, 10, 9);
        let token = addr(9);
        let mut token_event = event(&block, 1, addr(1), 7);
        token_event.asset = AssetId::Token(token);
        token_event.log_index = Some(0);

        ledger
            .apply(&[event(&block, 1, addr(1), 5), token_event], &block)
            .unwrap();

        assert_eq!(
            ledger.balance_of(addr(1), AssetId::Ether),
            I256::try_from(5).unwrap()
        );
        assert_eq!(
            ledger.balance_of(addr(1), AssetId::Token(token)),
            I256::try_from(7).unwrap()
        );
    }

    #[test]
    fn overflow_is_fatal_not_wrapped() {
        let mut ledger = new_ledger();
        let b100 = block_ref(100, 10, 9);
        let b101 = block_ref(101, 11, 10);

        let mut huge = event(&b100, 1, addr(1), 1);
        huge.delta = I256::MAX;
        ledger.apply(&[huge], &b100).unwrap();

        let err = ledger
            .apply(&[event(&b101, 2, addr(1), 1)], &b101)
            .unwrap_err();
        assert!(matches!(err, WatchError::Overflow { .. }));
        // The failed block left no trace.
        assert_eq!(ledger.balance_of(addr(1), AssetId::Ether), I256::MAX);
    }

    #[test]
    fn rollback_of_unknown_event_is_inconsistent() {
        let store = Arc::new(SqliteLedgerStore::new(Database::in_memory().unwrap()));
        let block = block_ref(100, 10, 9);
        let events = vec![event(&block, 1, addr(1), 5)];

        // Apply through one ledger, then restore a second one from a state
        // with the applied set missing -- the store disagrees with memory.
        let mut writer = BalanceLedger::new(Arc::clone(&store) as Arc<dyn LedgerStore>, 64);
        writer.apply(&events, &block).unwrap();

        let mut broken = BalanceLedger::restore(
            Arc::clone(&store) as Arc<dyn LedgerStore>,
            &LedgerState::default(),
            64,
        );
        let err = broken.rollback(&block).unwrap_err();
        assert!(matches!(err, WatchError::InconsistentRollback { .. }));
    }

    #[test]
    fn reader_sees_updates_from_the_writer() {
        let mut ledger = new_ledger();
        let reader = ledger.reader();
        let block = block_ref(100, 10, 9);

        assert_eq!(reader.balance_of(addr(1), AssetId::Ether), I256::ZERO);
        ledger.apply(&[event(&block, 1, addr(1), 5)], &block).unwrap();
        assert_eq!(
            reader.balance_of(addr(1), AssetId::Ether),
            I256::try_from(5).unwrap()
        );
        let account = reader.account(addr(1), AssetId::Ether).unwrap();
        assert_eq!(account.last_block, 100);
        assert_eq!(account.last_hash, hash(10));
    }

    #[test]
    fn restore_rebuilds_the_applied_set() {
        let store = Arc::new(SqliteLedgerStore::new(Database::in_memory().unwrap()));
        let block = block_ref(100, 10, 9);
        let events = vec![event(&block, 1, addr(1), 5)];

        let mut ledger = BalanceLedger::new(Arc::clone(&store) as Arc<dyn LedgerStore>, 64);
        ledger.apply(&events, &block).unwrap();

        let state = store.load().unwrap();
        let mut restored =
            BalanceLedger::restore(Arc::clone(&store) as Arc<dyn LedgerStore>, &state, 64);

        // Reapplying after a restart is still a no-op.
        let tasks = restored.apply(&events, &block).unwrap();
        assert!(tasks.is_empty());
        assert_eq!(
            restored.balance_of(addr(1), AssetId::Ether),
            I256::try_from(5).unwrap()
        );
    }
}
