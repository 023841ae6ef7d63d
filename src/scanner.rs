use crate::cursor::{Advance, ChainCursor};
use crate::error::WatchError;
use crate::extract::EventExtractor;
use crate::ledger::BalanceLedger;
use crate::queue::TaskQueue;
use crate::rpc::ChainNode;
use crate::status::ScannerStatus;
use crate::types::{Block, BlockHeader};
use crate::watchlist::WatchRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_retry::Retry;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tracing::{error, info, warn};

/// Poll cadence and the backoff budget for node calls. Backoff lives here,
/// not in the node client, so every retry is visible in one place.
#[derive(Debug, Clone)]
pub struct ScanPolicy {
    pub poll_interval: Duration,
    pub node_retry_base_ms: u64,
    pub node_retry_factor: u64,
    pub node_retry_max: Duration,
    pub node_retry_attempts: usize,
}

impl Default for ScanPolicy {
    fn default() -> Self {
        ScanPolicy {
            poll_interval: Duration::from_secs(12),
            node_retry_base_ms: 100,
            node_retry_factor: 2,
            node_retry_max: Duration::from_secs(10),
            node_retry_attempts: 5,
        }
    }
}

enum Progress {
    Applied,
    Idle,
}

/// Drives the ingestion cycle: poll the head, extend or resolve a reorg,
/// extract and apply, hand tasks to the dispatcher.
///
/// The scanner owns the ledger, so mutation is single-threaded by
/// construction. Transient node trouble is absorbed here with backoff;
/// consistency faults halt the loop and surface to the process.
pub struct Scanner<N: ChainNode> {
    node: N,
    cursor: ChainCursor,
    ledger: BalanceLedger,
    extractor: EventExtractor,
    registry: Arc<dyn WatchRegistry>,
    queue: TaskQueue,
    status: Arc<ScannerStatus>,
    policy: ScanPolicy,
    shutdown: watch::Receiver<bool>,
}

impl<N: ChainNode> Scanner<N> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node: N,
        cursor: ChainCursor,
        ledger: BalanceLedger,
        extractor: EventExtractor,
        registry: Arc<dyn WatchRegistry>,
        queue: TaskQueue,
        status: Arc<ScannerStatus>,
        policy: ScanPolicy,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Scanner {
            node,
            cursor,
            ledger,
            extractor,
            registry,
            queue,
            status,
            policy,
            shutdown,
        }
    }

    pub async fn run(&mut self) -> Result<(), WatchError> {
        match self.cursor.position() {
            Some(position) => info!("Starting scan from block {}", position.number),
            None => info!("Starting scan from the current head"),
        }

        loop {
            if *self.shutdown.borrow() {
                info!("Shutdown requested, stopping scanner");
                self.queue.close();
                return Ok(());
            }

            match self.cycle().await {
                Ok(Progress::Applied) => {}
                Ok(Progress::Idle) => self.idle_wait().await,
                Err(e) if e.is_transient() => {
                    warn!("Transient failure, will retry: {}", e);
                    self.idle_wait().await;
                }
                Err(e) => {
                    error!("Fatal fault, halting ingestion: {}", e);
                    self.status.halt();
                    self.queue.close();
                    return Err(e);
                }
            }
        }
    }

    async fn cycle(&mut self) -> Result<Progress, WatchError> {
        let head = self.fetch_head().await?;

        let target = match self.cursor.position() {
            Some(position) if position.hash == head.hash => return Ok(Progress::Idle),
            Some(position) => position.number.saturating_add(1).min(head.number),
            None => head.number,
        };

        let block = self.fetch_block(target).await?;
        match self.cursor.classify(&self.node, &block).await? {
            Advance::Extends => {
                self.ingest(&block).await?;
                Ok(Progress::Applied)
            }
            Advance::Reorg { ancestor, orphaned } => {
                warn!(
                    "Reorg detected at block {}: rolling back {} block(s) to ancestor {}",
                    block.number,
                    orphaned.len(),
                    ancestor.number
                );
                // One rollback at a time, popping the cursor as each lands,
                // so a failure partway leaves cursor and ledger agreeing.
                for orphan in &orphaned {
                    self.ledger.rollback(orphan)?;
                    self.cursor.pop_tip();
                }
                self.status.record_block(ancestor);
                // The canonical replacements are fetched by the following
                // cycles, straight from the node's head chain.
                Ok(Progress::Applied)
            }
        }
    }

    async fn ingest(&mut self, block: &Block) -> Result<(), WatchError> {
        // Fixed snapshot per block: addresses registered mid-extraction
        // only take effect from the next block.
        let watched = self.registry.snapshot();
        let extraction = self.extractor.extract(block, &watched)?;
        if extraction.skipped_logs > 0 {
            warn!(
                "Skipped {} malformed log(s) in block {}",
                extraction.skipped_logs, block.number
            );
            self.status.record_skipped_logs(extraction.skipped_logs);
        }

        let block_ref = block.block_ref();
        let tasks = self.ledger.apply(&extraction.events, &block_ref)?;
        self.cursor.accept(block_ref);
        self.status.record_block(block_ref);

        for task in tasks {
            self.queue.push(task).await;
        }
        Ok(())
    }

    async fn fetch_head(&self) -> Result<BlockHeader, WatchError> {
        let node = &self.node;
        Retry::spawn(self.retry_strategy(), || node.head())
            .await
            .map_err(WatchError::from)
    }

    async fn fetch_block(&self, number: u64) -> Result<Block, WatchError> {
        let node = &self.node;
        Retry::spawn(self.retry_strategy(), || node.block_by_number(number))
            .await
            .map_err(WatchError::from)
    }

    fn retry_strategy(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(self.policy.node_retry_base_ms)
            .factor(self.policy.node_retry_factor)
            .max_delay(self.policy.node_retry_max)
            .map(jitter)
            .take(self.policy.node_retry_attempts)
    }

    async fn idle_wait(&mut self) {
        let poll_interval = self.policy.poll_interval;
        tokio::select! {
            _ = sleep(poll_interval) => {}
            _ = self.shutdown.changed() => {}
        }
    }
}
