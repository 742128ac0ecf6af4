//! Retryable writes statistics
//!
//! Process-wide counters published by the session layer. The transactions
//! collection write count is bumped from the commit handler of every
//! session record update, so it reflects durable writes only.

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};

static GLOBAL: Lazy<RetryableWritesStats> = Lazy::new(RetryableWritesStats::default);

/// Counters for retryable-write activity
#[derive(Default)]
pub struct RetryableWritesStats {
    transactions_collection_write_count: AtomicU64,
    retried_statements_count: AtomicU64,
}

impl RetryableWritesStats {
    /// The process-wide instance
    pub fn get() -> &'static RetryableWritesStats {
        &GLOBAL
    }

    /// Record one durable write to the session transaction collection
    pub fn increment_transactions_collection_write_count(&self) {
        self.transactions_collection_write_count
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Number of durable writes to the session transaction collection
    pub fn transactions_collection_write_count(&self) -> u64 {
        self.transactions_collection_write_count
            .load(Ordering::Relaxed)
    }

    /// Record a statement that was answered from history instead of re-run
    pub fn increment_retried_statements_count(&self) {
        self.retried_statements_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of statements answered from history
    pub fn retried_statements_count(&self) -> u64 {
        self.retried_statements_count.load(Ordering::Relaxed)
    }
}
