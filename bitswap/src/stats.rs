//! Aggregate exchange counters
//!
//! Cheap atomics updated from the engine and coordinator; per-peer detail
//! lives in the ledgers.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Live counters for one engine instance
#[derive(Debug, Default)]
pub struct Stats {
    blocks_sent: AtomicU64,
    data_sent: AtomicU64,
    blocks_received: AtomicU64,
    data_received: AtomicU64,
    dup_blocks_received: AtomicU64,
    dup_data_received: AtomicU64,
    messages_received: AtomicU64,
    provider_dial_failures: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub blocks_sent: u64,
    pub data_sent: u64,
    pub blocks_received: u64,
    pub data_received: u64,
    pub dup_blocks_received: u64,
    pub dup_data_received: u64,
    pub messages_received: u64,
    pub provider_dial_failures: u64,
}

impl Stats {
    /// Record a block sent to any peer
    pub fn record_block_sent(&self, bytes: u64) {
        self.blocks_sent.fetch_add(1, Ordering::Relaxed);
        self.data_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a block received from any peer
    pub fn record_block_received(&self, bytes: u64) {
        self.blocks_received.fetch_add(1, Ordering::Relaxed);
        self.data_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a received block we already had and nobody was waiting for
    pub fn record_duplicate(&self, bytes: u64) {
        self.dup_blocks_received.fetch_add(1, Ordering::Relaxed);
        self.dup_data_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a processed inbound message
    pub fn record_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record providers that could not be dialled during `find_and_connect`
    pub fn record_provider_dial_failures(&self, n: u64) {
        self.provider_dial_failures.fetch_add(n, Ordering::Relaxed);
    }

    /// Copy the counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            blocks_sent: self.blocks_sent.load(Ordering::Relaxed),
            data_sent: self.data_sent.load(Ordering::Relaxed),
            blocks_received: self.blocks_received.load(Ordering::Relaxed),
            data_received: self.data_received.load(Ordering::Relaxed),
            dup_blocks_received: self.dup_blocks_received.load(Ordering::Relaxed),
            dup_data_received: self.dup_data_received.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            provider_dial_failures: self.provider_dial_failures.load(Ordering::Relaxed),
        }
    }
}
