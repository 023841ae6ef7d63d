//! Shared fixtures: an in-memory chain node the tests can extend and
//! reorganize, recording notifiers, and a wired-up scanner rig.

use alloy_primitives::{Address, B256, Bytes, U256};
use anyhow::anyhow;
use async_trait::async_trait;
use eth_balance_watcher::cursor::ChainCursor;
use eth_balance_watcher::dispatcher::{DispatchPolicy, Dispatcher};
use eth_balance_watcher::error::WatchError;
use eth_balance_watcher::extract::EventExtractor;
use eth_balance_watcher::ledger::{BalanceLedger, LedgerReader};
use eth_balance_watcher::notify::Notifier;
use eth_balance_watcher::queue::TaskQueue;
use eth_balance_watcher::repository::{Database, LedgerStore, SqliteLedgerStore};
use eth_balance_watcher::rpc::{ChainNode, NodeError};
use eth_balance_watcher::scanner::{ScanPolicy, Scanner};
use eth_balance_watcher::status::ScannerStatus;
use eth_balance_watcher::types::{Block, BlockHeader, EventKey, Log, NotificationTask, Transaction};
use eth_balance_watcher::watchlist::InMemoryWatchRegistry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub fn addr(tag: u8) -> Address {
    Address::with_last_byte(tag)
}

/// Deterministic block hash: number in the first bytes, fork tag in the
/// last, so sibling blocks at one height differ.
pub fn block_hash(number: u64, fork: u8) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[..8].copy_from_slice(&number.to_be_bytes());
    bytes[31] = fork;
    B256::from(bytes)
}

pub fn block(number: u64, fork: u8, parent_hash: B256, transactions: Vec<Transaction>) -> Block {
    Block {
        number,
        hash: block_hash(number, fork),
        parent_hash,
        timestamp: 1_700_000_000 + number,
        transactions,
    }
}

pub fn native_tx(tag: u8, from: Address, to: Address, value: u64) -> Transaction {
    Transaction {
        hash: B256::with_last_byte(tag),
        from,
        to: Some(to),
        value: U256::from(value),
        success: true,
        logs: Vec::new(),
    }
}

fn address_topic(address: Address) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[12..].copy_from_slice(address.as_slice());
    B256::from(bytes)
}

pub fn transfer_log(token: Address, from: Address, to: Address, amount: u64, index: u64) -> Log {
    Log {
        address: token,
        topics: vec![
            EventExtractor::transfer_topic(),
            address_topic(from),
            address_topic(to),
        ],
        data: Bytes::from(U256::from(amount).to_be_bytes::<32>().to_vec()),
        index,
    }
}

/// Log with the Transfer signature but a truncated topic list.
pub fn malformed_log(token: Address, index: u64) -> Log {
    Log {
        address: token,
        topics: vec![EventExtractor::transfer_topic()],
        data: Bytes::new(),
        index,
    }
}

#[derive(Default)]
struct ChainState {
    by_number: HashMap<u64, Block>,
    by_hash: HashMap<B256, Block>,
    head: Option<BlockHeader>,
}

/// In-memory chain the tests drive: extend it block by block, or swap in a
/// divergent canonical branch to simulate a reorg. Old blocks stay
/// reachable by hash, exactly like a real node keeps orphaned headers.
#[derive(Clone, Default)]
pub struct MockNode {
    state: Arc<Mutex<ChainState>>,
}

impl MockNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&self, block: Block) {
        let mut state = self.state.lock().unwrap();
        state.head = Some(block.header());
        state.by_number.insert(block.number, block.clone());
        state.by_hash.insert(block.hash, block);
    }

    /// Replace the canonical chain from `blocks[0].number` upward.
    pub fn reorg_to(&self, blocks: Vec<Block>) {
        let mut state = self.state.lock().unwrap();
        for block in blocks {
            state.head = Some(block.header());
            state.by_number.insert(block.number, block.clone());
            state.by_hash.insert(block.hash, block);
        }
    }
}

#[async_trait]
impl ChainNode for MockNode {
    async fn head(&self) -> Result<BlockHeader, NodeError> {
        self.state
            .lock()
            .unwrap()
            .head
            .ok_or_else(|| NodeError::NotFound("head".to_string()))
    }

    async fn block_by_number(&self, number: u64) -> Result<Block, NodeError> {
        self.state
            .lock()
            .unwrap()
            .by_number
            .get(&number)
            .cloned()
            .ok_or_else(|| NodeError::NotFound(format!("block {number}")))
    }

    async fn header_by_hash(&self, hash: B256) -> Result<BlockHeader, NodeError> {
        self.state
            .lock()
            .unwrap()
            .by_hash
            .get(&hash)
            .map(Block::header)
            .ok_or_else(|| NodeError::NotFound(format!("block {hash:?}")))
    }
}

/// Records every delivered payload; optionally fails every attempt.
#[derive(Default)]
pub struct RecordingNotifier {
    pub fail_all: bool,
    delivered: Mutex<Vec<EventKey>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        RecordingNotifier {
            fail_all: true,
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub fn delivered(&self) -> Vec<EventKey> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn deliver(&self, task: &NotificationTask) -> anyhow::Result<()> {
        if self.fail_all {
            return Err(anyhow!("endpoint down"));
        }
        self.delivered.lock().unwrap().push(task.key);
        Ok(())
    }
}

/// A scanner plus dispatcher wired the same way the binary wires them,
/// running against the mock node until the test stops it.
pub struct TestRig {
    pub node: MockNode,
    pub store: Arc<SqliteLedgerStore>,
    pub status: Arc<ScannerStatus>,
    pub reader: LedgerReader,
    pub registry: Arc<InMemoryWatchRegistry>,
    scanner: JoinHandle<Result<(), WatchError>>,
    workers: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

pub struct RigOptions {
    pub watched: Vec<Address>,
    pub tokens: Vec<Address>,
    pub max_delivery_attempts: usize,
}

impl Default for RigOptions {
    fn default() -> Self {
        RigOptions {
            watched: Vec::new(),
            tokens: Vec::new(),
            max_delivery_attempts: 6,
        }
    }
}

impl TestRig {
    pub async fn start(
        node: MockNode,
        store: Arc<SqliteLedgerStore>,
        notifier: Arc<dyn Notifier>,
        options: RigOptions,
    ) -> Self {
        const LOOKBACK: u64 = 16;

        let state = store.load().unwrap();
        let status = Arc::new(ScannerStatus::default());
        let queue = TaskQueue::new(64, Duration::from_millis(5));
        let registry = Arc::new(InMemoryWatchRegistry::new(options.watched));

        let dispatcher = Arc::new(Dispatcher::new(
            queue.clone(),
            notifier,
            Arc::clone(&store) as Arc<dyn LedgerStore>,
            Arc::clone(&status),
            DispatchPolicy {
                max_attempts: options.max_delivery_attempts,
                backoff_base_ms: 1,
                backoff_factor: 1,
                backoff_max: Duration::from_millis(2),
            },
        ));
        let workers = dispatcher.spawn(2);

        for task in state.pending_tasks.iter().cloned() {
            queue.push(task).await;
        }

        let cursor = ChainCursor::restore(state.recent_blocks.clone(), LOOKBACK);
        let ledger = BalanceLedger::restore(
            Arc::clone(&store) as Arc<dyn LedgerStore>,
            &state,
            LOOKBACK,
        );
        let reader = ledger.reader();
        let extractor = EventExtractor::new(options.tokens.into_iter().collect());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut scanner = Scanner::new(
            node.clone(),
            cursor,
            ledger,
            extractor,
            Arc::clone(&registry) as Arc<dyn eth_balance_watcher::watchlist::WatchRegistry>,
            queue,
            Arc::clone(&status),
            ScanPolicy {
                poll_interval: Duration::from_millis(20),
                node_retry_base_ms: 1,
                node_retry_factor: 1,
                node_retry_max: Duration::from_millis(2),
                node_retry_attempts: 2,
            },
            shutdown_rx,
        );
        let scanner = tokio::spawn(async move { scanner.run().await });

        TestRig {
            node,
            store,
            status,
            reader,
            registry,
            scanner,
            workers,
            shutdown: shutdown_tx,
        }
    }

    pub async fn wait_until(&self, mut condition: impl FnMut(&TestRig) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition(self) {
            if tokio::time::Instant::now() > deadline {
                panic!("condition not reached within 5s");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn wait_for_block(&self, number: u64, fork: u8) {
        let expected = block_hash(number, fork);
        self.wait_until(|rig| {
            rig.status
                .last_processed()
                .map(|b| b.number == number && b.hash == expected)
                .unwrap_or(false)
        })
        .await;
    }

    /// Stop the scanner, drain the dispatcher, return the scanner outcome.
    pub async fn stop(self) -> Result<(), WatchError> {
        let _ = self.shutdown.send(true);
        let result = self.scanner.await.expect("scanner task panicked");
        for worker in self.workers {
            worker.await.expect("dispatcher worker panicked");
        }
        result
    }
}

pub fn in_memory_store() -> Arc<SqliteLedgerStore> {
    Arc::new(SqliteLedgerStore::new(Database::in_memory().unwrap()))
}
