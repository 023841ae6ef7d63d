use crate::error::WatchError;
use crate::types::{Block, BlockHeader, Log, Transaction};
use alloy::consensus::{Transaction as _, TxReceipt as _};
use alloy::eips::BlockId;
use alloy::providers::fillers::FillProvider;
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::BlockNumberOrTag;
use alloy_primitives::B256;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

type AlloyFullProvider = FillProvider<
    alloy::providers::fillers::JoinFill<
        alloy::providers::Identity,
        alloy::providers::fillers::JoinFill<
            alloy::providers::fillers::GasFiller,
            alloy::providers::fillers::JoinFill<
                alloy::providers::fillers::BlobGasFiller,
                alloy::providers::fillers::JoinFill<
                    alloy::providers::fillers::NonceFiller,
                    alloy::providers::fillers::ChainIdFiller,
                >,
            >,
        >,
    >,
    alloy::providers::RootProvider,
>;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Failures at the node boundary. `Unavailable` covers connection errors,
/// transport errors and timeouts; a timeout is never interpreted as a reorg
/// signal.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node unavailable: {0}")]
    Unavailable(String),
    #[error("block {0} not found")]
    NotFound(String),
}

impl From<NodeError> for WatchError {
    fn from(err: NodeError) -> Self {
        match err {
            NodeError::Unavailable(msg) => WatchError::NodeUnavailable(msg),
            NodeError::NotFound(what) => WatchError::BlockNotFound(what),
        }
    }
}

/// Read-only view of the chain node. Implementations do not retry; the
/// scanner loop owns backoff so that it is observable in one place.
#[async_trait]
pub trait ChainNode: Send + Sync {
    /// Current canonical head header.
    async fn head(&self) -> Result<BlockHeader, NodeError>;

    /// Full block by number, with receipt status and logs joined onto each
    /// transaction.
    async fn block_by_number(&self, number: u64) -> Result<Block, NodeError>;

    /// Header by hash, used when walking ancestry during a reorg.
    async fn header_by_hash(&self, hash: B256) -> Result<BlockHeader, NodeError>;
}

#[derive(Clone)]
pub struct RpcClient {
    providers: Vec<AlloyFullProvider>,
    urls: Vec<String>,
    current_provider: Arc<AtomicUsize>,
}

impl RpcClient {
    pub fn new(rpc_urls: &[String]) -> Result<Self> {
        if rpc_urls.is_empty() {
            return Err(anyhow::anyhow!("At least one RPC URL must be provided"));
        }

        let mut providers = Vec::new();
        for url in rpc_urls {
            let parsed_url = url
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid RPC URL: {}", url))?;
            let provider: AlloyFullProvider = ProviderBuilder::new().connect_http(parsed_url);
            providers.push(provider);
        }

        Ok(RpcClient {
            providers,
            urls: rpc_urls.to_vec(),
            current_provider: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn get_provider(&self) -> &AlloyFullProvider {
        let index = self.current_provider.load(Ordering::Relaxed) % self.providers.len();
        &self.providers[index]
    }

    pub fn get_current_url(&self) -> &str {
        let index = self.current_provider.load(Ordering::Relaxed) % self.urls.len();
        &self.urls[index]
    }

    pub fn rotate_provider(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.providers.len();
        self.current_provider.store(next, Ordering::Relaxed);

        if self.providers.len() > 1 {
            debug!("Rotating to RPC provider #{}", next);
        }
    }

    fn unavailable(&self, error_str: &str) -> NodeError {
        warn!(
            "RPC error on {}: {}, rotating provider",
            self.get_current_url(),
            error_str
        );
        self.rotate_provider();
        NodeError::Unavailable(error_str.to_string())
    }

    fn timed_out(&self) -> NodeError {
        warn!(
            "Request timeout after {} seconds on {}, rotating provider",
            REQUEST_TIMEOUT.as_secs(),
            self.get_current_url()
        );
        self.rotate_provider();
        NodeError::Unavailable(format!(
            "request timeout after {} seconds",
            REQUEST_TIMEOUT.as_secs()
        ))
    }
}

#[async_trait]
impl ChainNode for RpcClient {
    async fn head(&self) -> Result<BlockHeader, NodeError> {
        let provider = self.get_provider();
        let future = provider.get_block_by_number(BlockNumberOrTag::Latest);
        match timeout(REQUEST_TIMEOUT, future).await {
            Ok(Ok(Some(block))) => Ok(BlockHeader {
                number: block.header.number,
                hash: block.header.hash,
                parent_hash: block.header.parent_hash,
            }),
            Ok(Ok(None)) => Err(NodeError::NotFound("latest".to_string())),
            Ok(Err(e)) => Err(self.unavailable(&e.to_string())),
            Err(_) => Err(self.timed_out()),
        }
    }

    async fn block_by_number(&self, number: u64) -> Result<Block, NodeError> {
        let provider = self.get_provider();

        let future = provider
            .get_block_by_number(BlockNumberOrTag::Number(number))
            .full();
        let block = match timeout(REQUEST_TIMEOUT, future).await {
            Ok(Ok(Some(block))) => block,
            Ok(Ok(None)) => return Err(NodeError::NotFound(format!("block {number}"))),
            Ok(Err(e)) => return Err(self.unavailable(&e.to_string())),
            Err(_) => return Err(self.timed_out()),
        };

        let future = provider.get_block_receipts(BlockId::number(number));
        let receipts = match timeout(REQUEST_TIMEOUT, future).await {
            Ok(Ok(Some(receipts))) => receipts,
            Ok(Ok(None)) => {
                return Err(NodeError::NotFound(format!("receipts for block {number}")));
            }
            Ok(Err(e)) => return Err(self.unavailable(&e.to_string())),
            Err(_) => return Err(self.timed_out()),
        };

        let mut receipts_by_tx: HashMap<B256, (bool, Vec<Log>)> = HashMap::new();
        for receipt in &receipts {
            let logs = receipt
                .inner
                .logs()
                .iter()
                .filter_map(|log| {
                    // A numbered block never carries unindexed (pending) logs.
                    let index = log.log_index?;
                    Some(Log {
                        address: log.inner.address,
                        topics: log.topics().to_vec(),
                        data: log.data().data.clone(),
                        index,
                    })
                })
                .collect();
            receipts_by_tx.insert(receipt.transaction_hash, (receipt.status(), logs));
        }

        let mut transactions = Vec::new();
        for tx in block.transactions.into_transactions() {
            let hash = *tx.inner.tx_hash();
            let (success, logs) = receipts_by_tx.remove(&hash).unwrap_or((false, Vec::new()));
            transactions.push(Transaction {
                hash,
                from: tx.inner.signer(),
                to: tx.inner.to(),
                value: tx.inner.value(),
                success,
                logs,
            });
        }

        Ok(Block {
            number: block.header.number,
            hash: block.header.hash,
            parent_hash: block.header.parent_hash,
            timestamp: block.header.timestamp,
            transactions,
        })
    }

    async fn header_by_hash(&self, hash: B256) -> Result<BlockHeader, NodeError> {
        let provider = self.get_provider();
        let future = provider.get_block_by_hash(hash);
        match timeout(REQUEST_TIMEOUT, future).await {
            Ok(Ok(Some(block))) => Ok(BlockHeader {
                number: block.header.number,
                hash: block.header.hash,
                parent_hash: block.header.parent_hash,
            }),
            Ok(Ok(None)) => Err(NodeError::NotFound(format!("block {hash:?}"))),
            Ok(Err(e)) => Err(self.unavailable(&e.to_string())),
            Err(_) => Err(self.timed_out()),
        }
    }
}
