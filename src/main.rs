use anyhow::{Context, Result};
use clap::Parser;
use eth_balance_watcher::config::Config;
use eth_balance_watcher::cursor::ChainCursor;
use eth_balance_watcher::dispatcher::{DispatchPolicy, Dispatcher};
use eth_balance_watcher::extract::EventExtractor;
use eth_balance_watcher::ledger::BalanceLedger;
use eth_balance_watcher::notify::{LogNotifier, Notifier, WebhookNotifier};
use eth_balance_watcher::queue::TaskQueue;
use eth_balance_watcher::repository::{Database, LedgerStore, SqliteLedgerStore};
use eth_balance_watcher::rpc::RpcClient;
use eth_balance_watcher::scanner::{ScanPolicy, Scanner};
use eth_balance_watcher::status::ScannerStatus;
use eth_balance_watcher::watchlist::{self, InMemoryWatchRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser)]
#[command(about = "Watch an Ethereum chain for balance changes of a set of addresses")]
struct Cli {
    /// Override the WATCHLIST path from the environment.
    #[arg(long)]
    watchlist: Option<PathBuf>,
    /// Override the DATABASE_URL from the environment.
    #[arg(long)]
    database: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();

    info!("Starting Ethereum balance watcher");

    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if let Some(path) = cli.watchlist {
        config.watchlist_path = path;
    }
    if let Some(database) = cli.database {
        config.database_url = database;
    }
    info!(
        "Configuration loaded: {} RPC endpoint(s), lookback {} blocks",
        config.json_rpc_urls.len(),
        config.reorg_lookback
    );

    let db = Database::new(&config.database_url)?;
    let store: Arc<dyn LedgerStore> = Arc::new(SqliteLedgerStore::new(db));
    let state = store.load().context("Failed to load ledger state")?;
    match state.cursor {
        Some((number, _)) => info!("Resuming from persisted cursor at block {}", number),
        None => info!("No persisted cursor, starting fresh"),
    }

    let watchlist = watchlist::load_watchlist(&config.watchlist_path)?;
    info!(
        "Watching {} address(es) and {} token contract(s)",
        watchlist.addresses.len(),
        watchlist.tokens.len()
    );
    let registry = Arc::new(InMemoryWatchRegistry::new(watchlist.addresses));
    let extractor = EventExtractor::new(watchlist.tokens.into_iter().collect());

    let status = Arc::new(ScannerStatus::default());
    let queue = TaskQueue::new(config.queue_capacity, Duration::from_millis(250));

    let notifier: Arc<dyn Notifier> = match &config.notify_url {
        Some(url) => Arc::new(WebhookNotifier::new(url)?),
        None => {
            info!("NOTIFY_URL not set, logging balance changes only");
            Arc::new(LogNotifier)
        }
    };

    let dispatcher = Arc::new(Dispatcher::new(
        queue.clone(),
        notifier,
        Arc::clone(&store),
        Arc::clone(&status),
        DispatchPolicy {
            max_attempts: config.max_delivery_attempts,
            ..DispatchPolicy::default()
        },
    ));
    let workers = dispatcher.spawn(config.dispatch_workers);

    // Tasks persisted by an earlier run but never acked go out again.
    if !state.pending_tasks.is_empty() {
        info!(
            "Re-enqueueing {} undelivered notification task(s)",
            state.pending_tasks.len()
        );
        for task in state.pending_tasks.iter().cloned() {
            queue.push(task).await;
        }
    }

    let cursor = ChainCursor::restore(state.recent_blocks.clone(), config.reorg_lookback);
    let ledger = BalanceLedger::restore(Arc::clone(&store), &state, config.reorg_lookback);
    let client = RpcClient::new(&config.json_rpc_urls)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    let mut scanner = Scanner::new(
        client,
        cursor,
        ledger,
        extractor,
        registry,
        queue,
        Arc::clone(&status),
        ScanPolicy {
            poll_interval: config.poll_interval,
            ..ScanPolicy::default()
        },
        shutdown_rx,
    );

    let result = scanner.run().await;

    // The scanner closed the queue on its way out; wait for the workers to
    // drain what is left.
    futures::future::join_all(workers).await;

    if let Err(e) = result {
        error!(
            "Scanner halted: {} (last processed block: {:?}, dead letters: {})",
            e,
            status.last_processed().map(|b| b.number),
            status.dead_letters()
        );
        return Err(e.into());
    }

    info!(
        "Watcher stopped cleanly at block {:?}",
        status.last_processed().map(|b| b.number)
    );
    Ok(())
}
