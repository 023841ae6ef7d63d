use alloy_primitives::Address;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::RwLock;

/// Addresses currently of interest. Registration and removal happen
/// elsewhere (the API front end); the scanner only reads, and always
/// through `snapshot` so one block is extracted against one fixed view.
pub trait WatchRegistry: Send + Sync {
    fn is_watched(&self, address: &Address) -> bool;
    fn snapshot(&self) -> HashSet<Address>;
}

#[derive(Default)]
pub struct InMemoryWatchRegistry {
    addresses: RwLock<HashSet<Address>>,
}

impl InMemoryWatchRegistry {
    pub fn new(addresses: impl IntoIterator<Item = Address>) -> Self {
        InMemoryWatchRegistry {
            addresses: RwLock::new(addresses.into_iter().collect()),
        }
    }

    pub fn insert(&self, address: Address) {
        self.addresses
            .write()
            .expect("watch registry lock poisoned")
            .insert(address);
    }

    pub fn remove(&self, address: &Address) {
        self.addresses
            .write()
            .expect("watch registry lock poisoned")
            .remove(address);
    }
}

impl WatchRegistry for InMemoryWatchRegistry {
    fn is_watched(&self, address: &Address) -> bool {
        self.addresses
            .read()
            .expect("watch registry lock poisoned")
            .contains(address)
    }

    fn snapshot(&self) -> HashSet<Address> {
        self.addresses
            .read()
            .expect("watch registry lock poisoned")
            .clone()
    }
}

/// On-disk watchlist: the addresses to track and the token contracts whose
/// Transfer events count as balance changes.
#[derive(Debug, Deserialize)]
pub struct WatchlistFile {
    pub addresses: Vec<Address>,
    #[serde(default)]
    pub tokens: Vec<Address>,
}

pub fn load_watchlist(path: &Path) -> Result<WatchlistFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read watchlist {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse watchlist {}", path.display()))
}
