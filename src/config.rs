use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration, loaded from the environment. Policy constants
/// (poll cadence, lookback depth, retry budgets) are tunable with the
/// defaults below.
#[derive(Debug, Clone)]
pub struct Config {
    pub json_rpc_urls: Vec<String>,
    pub database_url: String,
    pub watchlist_path: PathBuf,
    /// Webhook endpoint for balance notifications; log-only when unset.
    pub notify_url: Option<String>,
    pub poll_interval: Duration,
    /// How many accepted blocks to remember for reorg resolution. A fork
    /// below this window halts ingestion.
    pub reorg_lookback: u64,
    pub queue_capacity: usize,
    pub dispatch_workers: usize,
    pub max_delivery_attempts: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let urls = std::env::var("JSON_RPC_URLS")
            .or_else(|_| std::env::var("JSON_RPC_URL"))
            .context("JSON_RPC_URLS must be set in .env")?;
        let json_rpc_urls: Vec<String> = urls
            .split(',')
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .collect();

        let database_url =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:./watcher.db".to_string());

        let watchlist_path = std::env::var("WATCHLIST")
            .unwrap_or_else(|_| "./watchlist.json".to_string())
            .into();

        let notify_url = std::env::var("NOTIFY_URL").ok();

        let poll_interval = Duration::from_secs(parse_var("POLL_INTERVAL_SECS", 12)?);
        let reorg_lookback = parse_var("REORG_LOOKBACK", 64)?;
        let queue_capacity = parse_var("QUEUE_CAPACITY", 1024)?;
        let dispatch_workers = parse_var("DISPATCH_WORKERS", 4)?;
        let max_delivery_attempts = parse_var("MAX_DELIVERY_ATTEMPTS", 6)?;

        Ok(Config {
            json_rpc_urls,
            database_url,
            watchlist_path,
            notify_url,
            poll_interval,
            reorg_lookback,
            queue_capacity,
            dispatch_workers,
            max_delivery_attempts,
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid {name}: {value}")),
        Err(_) => Ok(default),
    }
}
