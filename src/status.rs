use crate::types::BlockRef;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Shared operational signals for external monitoring: where ingestion is,
/// how many deliveries were abandoned, and whether the pipeline halted on a
/// fatal fault (which doubles as the staleness flag for balance reads).
#[derive(Debug, Default)]
pub struct ScannerStatus {
    last_processed: Mutex<Option<BlockRef>>,
    dead_letters: AtomicU64,
    skipped_logs: AtomicU64,
    halted: AtomicBool,
}

impl ScannerStatus {
    pub fn record_block(&self, block: BlockRef) {
        *self.last_processed.lock().expect("status mutex poisoned") = Some(block);
    }

    pub fn last_processed(&self) -> Option<BlockRef> {
        *self.last_processed.lock().expect("status mutex poisoned")
    }

    pub fn record_dead_letter(&self) {
        self.dead_letters.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dead_letters(&self) -> u64 {
        self.dead_letters.load(Ordering::Relaxed)
    }

    pub fn record_skipped_logs(&self, count: u64) {
        self.skipped_logs.fetch_add(count, Ordering::Relaxed);
    }

    pub fn skipped_logs(&self) -> u64 {
        self.skipped_logs.load(Ordering::Relaxed)
    }

    /// Mark the pipeline as halted on a fatal fault. Balances stay readable
    /// but must be treated as stale from here on.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::Release);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }
}
