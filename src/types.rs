use alloy_primitives::{Address, B256, Bytes, I256, U256};
use serde::Serialize;

/// Header-only view of a block, used for head polling and ancestry walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
}

/// Identity of a block the scanner has accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
}

/// A fetched block, normalized so every transaction already carries its
/// receipt status and logs. Immutable once fetched.
#[derive(Debug, Clone)]
pub struct Block {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub timestamp: u64,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn block_ref(&self) -> BlockRef {
        BlockRef {
            number: self.number,
            hash: self.hash,
            parent_hash: self.parent_hash,
        }
    }

    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            number: self.number,
            hash: self.hash,
            parent_hash: self.parent_hash,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Transaction {
    pub hash: B256,
    pub from: Address,
    /// None for contract creation.
    pub to: Option<Address>,
    pub value: U256,
    /// Receipt status; failed transactions move no value.
    pub success: bool,
    pub logs: Vec<Log>,
}

#[derive(Debug, Clone)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    /// Block-level log index.
    pub index: u64,
}

/// The chain's native currency or a recognized token contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetId {
    Ether,
    Token(Address),
}

impl AssetId {
    pub fn encode(&self) -> String {
        match self {
            AssetId::Ether => "eth".to_string(),
            AssetId::Token(address) => format!("{address:?}"),
        }
    }
}

/// Unique identity of an applied balance event. Reapplying a key has no
/// additional effect; downstream consumers dedup on it as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct EventKey {
    pub block_hash: B256,
    pub tx_hash: B256,
    /// None for a native transfer (persisted as -1), the block-level log
    /// index for a token transfer.
    pub log_index: Option<u64>,
    pub address: Address,
}

/// One signed balance movement for one (address, asset) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceEvent {
    pub block_number: u64,
    pub block_hash: B256,
    pub tx_hash: B256,
    pub log_index: Option<u64>,
    pub address: Address,
    pub asset: AssetId,
    pub delta: I256,
}

impl BalanceEvent {
    pub fn key(&self) -> EventKey {
        EventKey {
            block_hash: self.block_hash,
            tx_hash: self.tx_hash,
            log_index: self.log_index,
            address: self.address,
        }
    }
}

/// Current balance of one (address, asset) pair and the block it was last
/// touched in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountBalance {
    pub address: Address,
    pub asset: AssetId,
    pub balance: I256,
    pub last_block: u64,
    pub last_hash: B256,
}

/// Work item handed from the ledger to the dispatcher. Persisted together
/// with its triggering event, deleted on delivery ack, kept with a dead
/// status after the retry budget is exhausted.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationTask {
    pub address: Address,
    pub asset: AssetId,
    pub delta: I256,
    pub new_balance: I256,
    pub key: EventKey,
    #[serde(skip)]
    pub attempts: u32,
}
