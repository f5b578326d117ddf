use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

#[derive(Default)]
pub struct Stats {
    pub total: AtomicU64,
    pub active: AtomicU64,
    pub fragmented: AtomicU64,
    pub direct: AtomicU64,
    pub failed: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a connection as active until the returned guard drops, which
    /// also happens when the handling task panics.
    pub fn track_connection(self: &Arc<Self>) -> ActiveGuard {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
        ActiveGuard {
            stats: Arc::clone(self),
        }
    }

    pub fn record_transfer(&self, sent: u64, received: u64) {
        self.bytes_out.fetch_add(sent, Ordering::Relaxed);
        self.bytes_in.fetch_add(received, Ordering::Relaxed);
    }

    pub fn print(&self) {
        info!(
            "total={} active={} fragmented={} direct={} failed={} in={}MB out={}MB",
            self.total.load(Ordering::Relaxed),
            self.active.load(Ordering::Relaxed),
            self.fragmented.load(Ordering::Relaxed),
            self.direct.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            self.bytes_in.load(Ordering::Relaxed) / 1_000_000,
            self.bytes_out.load(Ordering::Relaxed) / 1_000_000,
        );
    }

    pub fn spawn_reporter(self: &Arc<Self>, interval: Duration) {
        let stats = Arc::clone(self);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            // First tick fires immediately.
            timer.tick().await;
            loop {
                timer.tick().await;
                stats.print();
            }
        });
    }
}

pub struct ActiveGuard {
    stats: Arc<Stats>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
    }
}
