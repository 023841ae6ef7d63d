use super::database::Database;
use super::{LedgerState, LedgerStore};
use crate::types::{AccountBalance, AssetId, BalanceEvent, BlockRef, EventKey, NotificationTask};
use alloy_primitives::{Address, B256, I256};
use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, params};
use std::str::FromStr;

/// Sqlite-backed [`LedgerStore`]. One write transaction per applied or
/// rolled-back block; keys are stored as lowercase hex, amounts as signed
/// decimal strings so sqlite never does arithmetic on them.
pub struct SqliteLedgerStore {
    db: Database,
}

impl SqliteLedgerStore {
    const INSERT_BLOCK: &'static str =
        "INSERT OR REPLACE INTO blocks (number, hash, parent_hash) VALUES (?1, ?2, ?3)";

    const INSERT_EVENT: &'static str = "INSERT OR IGNORE INTO applied_events (
            block_hash, block_number, tx_hash, log_index, address, asset, delta
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)";

    const UPSERT_ACCOUNT: &'static str = "INSERT OR REPLACE INTO accounts (
            address, asset, balance, last_block, last_hash
        ) VALUES (?1, ?2, ?3, ?4, ?5)";

    const INSERT_TASK: &'static str = "INSERT OR REPLACE INTO tasks (
            block_hash, tx_hash, log_index, address, asset, delta, new_balance, status, attempts
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', 0)";

    const SET_CURSOR: &'static str =
        "INSERT OR REPLACE INTO cursor (id, block_number, block_hash) VALUES (1, ?1, ?2)";

    const SELECT_EVENTS_FOR_BLOCK: &'static str =
        "SELECT block_hash, block_number, tx_hash, log_index, address, asset, delta
         FROM applied_events WHERE block_hash = ?1 ORDER BY rowid ASC";

    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl LedgerStore for SqliteLedgerStore {
    fn load(&self) -> Result<LedgerState> {
        let conn = self.db.lock();

        let cursor: Option<(u64, String)> = conn
            .query_row(
                "SELECT block_number, block_hash FROM cursor WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let cursor = match cursor {
            Some((number, hash)) => Some((number, parse_hash(&hash)?)),
            None => None,
        };

        let mut stmt =
            conn.prepare("SELECT number, hash, parent_hash FROM blocks ORDER BY number ASC")?;
        let recent_blocks = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, u64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(number, hash, parent_hash)| {
                Ok(BlockRef {
                    number,
                    hash: parse_hash(&hash)?,
                    parent_hash: parse_hash(&parent_hash)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut stmt =
            conn.prepare("SELECT address, asset, balance, last_block, last_hash FROM accounts")?;
        let accounts = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, u64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(address, asset, balance, last_block, last_hash)| {
                Ok(AccountBalance {
                    address: parse_address(&address)?,
                    asset: parse_asset(&asset)?,
                    balance: parse_amount(&balance)?,
                    last_block,
                    last_hash: parse_hash(&last_hash)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut stmt = conn.prepare(
            "SELECT block_hash, block_number, tx_hash, log_index, address FROM applied_events",
        )?;
        let applied = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(block_hash, block_number, tx_hash, log_index, address)| {
                Ok((
                    EventKey {
                        block_hash: parse_hash(&block_hash)?,
                        tx_hash: parse_hash(&tx_hash)?,
                        log_index: log_index_from_sql(log_index),
                        address: parse_address(&address)?,
                    },
                    block_number,
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut stmt = conn.prepare(
            "SELECT block_hash, tx_hash, log_index, address, asset, delta, new_balance, attempts
             FROM tasks WHERE status = 'pending'",
        )?;
        let pending_tasks = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, u32>(7)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(
                |(block_hash, tx_hash, log_index, address, asset, delta, new_balance, attempts)| {
                    let address = parse_address(&address)?;
                    Ok(NotificationTask {
                        address,
                        asset: parse_asset(&asset)?,
                        delta: parse_amount(&delta)?,
                        new_balance: parse_amount(&new_balance)?,
                        key: EventKey {
                            block_hash: parse_hash(&block_hash)?,
                            tx_hash: parse_hash(&tx_hash)?,
                            log_index: log_index_from_sql(log_index),
                            address,
                        },
                        attempts,
                    })
                },
            )
            .collect::<Result<Vec<_>>>()?;

        Ok(LedgerState {
            cursor,
            recent_blocks,
            accounts,
            applied,
            pending_tasks,
        })
    }

    fn persist_block(
        &self,
        block: &BlockRef,
        events: &[BalanceEvent],
        balances: &[AccountBalance],
        tasks: &[NotificationTask],
        prune_below: u64,
    ) -> Result<()> {
        let conn = self.db.lock();
        let tx = conn.unchecked_transaction()?;

        tx.execute(
            Self::INSERT_BLOCK,
            params![
                block.number,
                hash_str(&block.hash),
                hash_str(&block.parent_hash)
            ],
        )?;

        {
            let mut stmt = tx.prepare(Self::INSERT_EVENT)?;
            for event in events {
                stmt.execute(params![
                    hash_str(&event.block_hash),
                    event.block_number,
                    hash_str(&event.tx_hash),
                    log_index_to_sql(event.log_index),
                    address_str(&event.address),
                    event.asset.encode(),
                    event.delta.to_string(),
                ])?;
            }
        }

        {
            let mut stmt = tx.prepare(Self::UPSERT_ACCOUNT)?;
            for account in balances {
                stmt.execute(params![
                    address_str(&account.address),
                    account.asset.encode(),
                    account.balance.to_string(),
                    account.last_block,
                    hash_str(&account.last_hash),
                ])?;
            }
        }

        {
            let mut stmt = tx.prepare(Self::INSERT_TASK)?;
            for task in tasks {
                stmt.execute(params![
                    hash_str(&task.key.block_hash),
                    hash_str(&task.key.tx_hash),
                    log_index_to_sql(task.key.log_index),
                    address_str(&task.key.address),
                    task.asset.encode(),
                    task.delta.to_string(),
                    task.new_balance.to_string(),
                ])?;
            }
        }

        tx.execute(Self::SET_CURSOR, params![block.number, hash_str(&block.hash)])?;

        tx.execute("DELETE FROM blocks WHERE number < ?1", params![prune_below])?;
        tx.execute(
            "DELETE FROM applied_events WHERE block_number < ?1",
            params![prune_below],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn events_for_block(&self, block_hash: B256) -> Result<Vec<BalanceEvent>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(Self::SELECT_EVENTS_FOR_BLOCK)?;
        let events = stmt
            .query_map(params![hash_str(&block_hash)], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(
                |(block_hash, block_number, tx_hash, log_index, address, asset, delta)| {
                    Ok(BalanceEvent {
                        block_number,
                        block_hash: parse_hash(&block_hash)?,
                        tx_hash: parse_hash(&tx_hash)?,
                        log_index: log_index_from_sql(log_index),
                        address: parse_address(&address)?,
                        asset: parse_asset(&asset)?,
                        delta: parse_amount(&delta)?,
                    })
                },
            )
            .collect::<Result<Vec<_>>>()?;
        Ok(events)
    }

    fn rollback_block(&self, block: &BlockRef, balances: &[AccountBalance]) -> Result<()> {
        let conn = self.db.lock();
        let tx = conn.unchecked_transaction()?;

        tx.execute(
            "DELETE FROM applied_events WHERE block_hash = ?1",
            params![hash_str(&block.hash)],
        )?;
        tx.execute(
            "DELETE FROM blocks WHERE hash = ?1",
            params![hash_str(&block.hash)],
        )?;
        tx.execute(
            "DELETE FROM tasks WHERE block_hash = ?1 AND status = 'pending'",
            params![hash_str(&block.hash)],
        )?;

        {
            let mut stmt = tx.prepare(Self::UPSERT_ACCOUNT)?;
            for account in balances {
                stmt.execute(params![
                    address_str(&account.address),
                    account.asset.encode(),
                    account.balance.to_string(),
                    account.last_block,
                    hash_str(&account.last_hash),
                ])?;
            }
        }

        let parent_number = block
            .number
            .checked_sub(1)
            .context("Cannot roll back the genesis block")?;
        tx.execute(
            Self::SET_CURSOR,
            params![parent_number, hash_str(&block.parent_hash)],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn mark_task_delivered(&self, key: &EventKey) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "DELETE FROM tasks
             WHERE block_hash = ?1 AND tx_hash = ?2 AND log_index = ?3 AND address = ?4",
            params![
                hash_str(&key.block_hash),
                hash_str(&key.tx_hash),
                log_index_to_sql(key.log_index),
                address_str(&key.address),
            ],
        )?;
        Ok(())
    }

    fn mark_task_dead_letter(&self, key: &EventKey) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "UPDATE tasks SET status = 'dead'
             WHERE block_hash = ?1 AND tx_hash = ?2 AND log_index = ?3 AND address = ?4",
            params![
                hash_str(&key.block_hash),
                hash_str(&key.tx_hash),
                log_index_to_sql(key.log_index),
                address_str(&key.address),
            ],
        )?;
        Ok(())
    }

    fn dead_letter_count(&self) -> Result<u64> {
        let conn = self.db.lock();
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE status = 'dead'",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn address_str(address: &Address) -> String {
    format!("{address:?}")
}

fn hash_str(hash: &B256) -> String {
    format!("{hash:?}")
}

fn parse_address(s: &str) -> Result<Address> {
    Address::from_str(s).with_context(|| format!("Invalid address in database: {s}"))
}

fn parse_hash(s: &str) -> Result<B256> {
    B256::from_str(s).with_context(|| format!("Invalid hash in database: {s}"))
}

fn parse_amount(s: &str) -> Result<I256> {
    I256::from_dec_str(s).with_context(|| format!("Invalid amount in database: {s}"))
}

fn parse_asset(s: &str) -> Result<AssetId> {
    if s == "eth" {
        Ok(AssetId::Ether)
    } else {
        Ok(AssetId::Token(parse_address(s)?))
    }
}

fn log_index_to_sql(index: Option<u64>) -> i64 {
    match index {
        Some(i) => i as i64,
        None => -1,
    }
}

fn log_index_from_sql(index: i64) -> Option<u64> {
    if index < 0 { None } else { Some(index as u64) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

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

    fn account(address: Address, balance: i64, block: &BlockRef) -> AccountBalance {
        AccountBalance {
            address,
            asset: AssetId::Ether,
            balance: I256::try_from(balance).unwrap(),
            last_block: block.number,
            last_hash: block.hash,
        }
    }

    fn task_for(event: &BalanceEvent, new_balance: i64) -> NotificationTask {
        NotificationTask {
            address: event.address,
            asset: event.asset,
            delta: event.delta,
            new_balance: I256::try_from(new_balance).unwrap(),
            key: event.key(),
            attempts: 0,
        }
    }

    #[test]
    fn empty_store_loads_empty_state() {
        let store = SqliteLedgerStore::new(Database::in_memory().unwrap());
        let state = store.load().unwrap();
        assert!(state.cursor.is_none());
        assert!(state.recent_blocks.is_empty());
        assert!(state.accounts.is_empty());
        assert!(state.pending_tasks.is_empty());
    }

    #[test]
    fn persist_then_load_roundtrip() {
        let store = SqliteLedgerStore::new(Database::in_memory().unwrap());
        let block = block_ref(100, 10, 9);
        let ev = event(&block, 1, addr(1), 5);
        let acct = account(addr(1), 5, &block);
        let task = task_for(&ev, 5);

        store
            .persist_block(&block, &[ev.clone()], &[acct.clone()], &[task], 0)
            .unwrap();

        let state = store.load().unwrap();
        assert_eq!(state.cursor, Some((100, hash(10))));
        assert_eq!(state.recent_blocks, vec![block]);
        assert_eq!(state.accounts, vec![acct]);
        assert_eq!(state.applied, vec![(ev.key(), 100)]);
        assert_eq!(state.pending_tasks.len(), 1);
        assert_eq!(state.pending_tasks[0].key, ev.key());

        let events = store.events_for_block(block.hash).unwrap();
        assert_eq!(events, vec![ev]);
    }

    #[test]
    fn rollback_removes_block_events_and_pending_tasks() {
        let store = SqliteLedgerStore::new(Database::in_memory().unwrap());
        let parent = block_ref(100, 10, 9);
        let block = block_ref(101, 11, 10);
        let ev = event(&block, 1, addr(1), 5);
        let task = task_for(&ev, 5);

        store
            .persist_block(&parent, &[], &[], &[], 0)
            .unwrap();
        store
            .persist_block(&block, &[ev.clone()], &[account(addr(1), 5, &block)], &[task], 0)
            .unwrap();

        store
            .rollback_block(&block, &[account(addr(1), 0, &parent)])
            .unwrap();

        let state = store.load().unwrap();
        assert_eq!(state.cursor, Some((100, hash(10))));
        assert_eq!(state.recent_blocks, vec![parent]);
        assert!(state.applied.is_empty());
        assert!(state.pending_tasks.is_empty());
        assert_eq!(state.accounts[0].balance, I256::ZERO);
        assert!(store.events_for_block(block.hash).unwrap().is_empty());
    }

    #[test]
    fn task_acks_update_status() {
        let store = SqliteLedgerStore::new(Database::in_memory().unwrap());
        let block = block_ref(100, 10, 9);
        let ev1 = event(&block, 1, addr(1), 5);
        let ev2 = event(&block, 2, addr(2), 7);

        store
            .persist_block(
                &block,
                &[ev1.clone(), ev2.clone()],
                &[account(addr(1), 5, &block), account(addr(2), 7, &block)],
                &[task_for(&ev1, 5), task_for(&ev2, 7)],
                0,
            )
            .unwrap();

        store.mark_task_delivered(&ev1.key()).unwrap();
        store.mark_task_dead_letter(&ev2.key()).unwrap();

        let state = store.load().unwrap();
        assert!(state.pending_tasks.is_empty());
        assert_eq!(store.dead_letter_count().unwrap(), 1);
    }

    #[test]
    fn pruning_drops_rows_below_the_window() {
        let store = SqliteLedgerStore::new(Database::in_memory().unwrap());
        let old = block_ref(100, 10, 9);
        let new = block_ref(200, 20, 19);

        store
            .persist_block(&old, &[event(&old, 1, addr(1), 5)], &[], &[], 0)
            .unwrap();
        store
            .persist_block(&new, &[event(&new, 2, addr(1), 5)], &[], &[], 150)
            .unwrap();

        let state = store.load().unwrap();
        assert_eq!(state.recent_blocks, vec![new]);
        assert_eq!(state.applied.len(), 1);
        assert_eq!(state.applied[0].1, 200);
    }

    #[test]
    fn negative_balances_survive_the_roundtrip() {
        let store = SqliteLedgerStore::new(Database::in_memory().unwrap());
        let block = block_ref(100, 10, 9);
        let acct = account(addr(1), -42, &block);

        store
            .persist_block(&block, &[], &[acct.clone()], &[], 0)
            .unwrap();

        let state = store.load().unwrap();
        assert_eq!(state.accounts, vec![acct]);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("watcher.db");
        let path = path.to_str().unwrap();

        let block = block_ref(100, 10, 9);
        {
            let store = SqliteLedgerStore::new(Database::new(path).unwrap());
            store
                .persist_block(&block, &[], &[account(addr(1), 5, &block)], &[], 0)
                .unwrap();
        }

        let store = SqliteLedgerStore::new(Database::new(path).unwrap());
        let state = store.load().unwrap();
        assert_eq!(state.cursor, Some((100, hash(10))));
        assert_eq!(state.accounts.len(), 1);
    }
}
