use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

/// Byte counters for one bridge, shared by both forwarding directions.
///
/// Also remembers when bytes last moved in either direction, so idleness is
/// judged for the bridge as a whole.
#[derive(Debug)]
pub struct TunnelStats {
    to_tunnel: AtomicU64,
    from_tunnel: AtomicU64,
    started: Instant,
    /// Milliseconds after `started`
    last_activity: AtomicU64,
}

impl Default for TunnelStats {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelStats {
    pub fn new() -> Self {
        Self {
            to_tunnel: AtomicU64::new(0),
            from_tunnel: AtomicU64::new(0),
            started: Instant::now(),
            last_activity: AtomicU64::new(0),
        }
    }

    pub fn record_to_tunnel(&self, bytes: usize) {
        self.to_tunnel.fetch_add(bytes as u64, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_from_tunnel(&self, bytes: usize) {
        self.from_tunnel.fetch_add(bytes as u64, Ordering::Relaxed);
        self.touch();
    }

    /// Time since bytes last moved in either direction
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }

    fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_activity.fetch_max(now, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransferTotals {
        TransferTotals {
            to_tunnel: self.to_tunnel.load(Ordering::Relaxed),
            from_tunnel: self.from_tunnel.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferTotals {
    pub to_tunnel: u64,
    pub from_tunnel: u64,
}

impl std::fmt::Display for TransferTotals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "sent={:.1}KiB received={:.1}KiB",
            self.to_tunnel as f64 / 1024.0,
            self.from_tunnel as f64 / 1024.0
        )
    }
}
