//! [`ChainEnv`] – the host readings a kernel depends on.
//!
//! A kernel never reads the system clock directly.  It asks its environment
//! for the current chain time and block height, which keeps every read
//! reproducible in tests and lets a host decide where time comes from.
//!
//! - [`SystemEnv`] – wall clock (made non-decreasing) with a height derived
//!   from a fixed block interval.
//! - [`ManualEnv`] – settable clock and height for tests and simulations.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

/// Source of chain time and block height.
///
/// Implementations must return a non-decreasing `timestamp` across calls.
pub trait ChainEnv: Send + Sync {
    /// Current chain time in seconds.
    fn timestamp(&self) -> u64;

    /// Current block height / sequence number.
    fn block_height(&self) -> u64;
}

// ────────────────────────────────────────────────────────────────────────────
// SystemEnv
// ────────────────────────────────────────────────────────────────────────────

/// Default block interval, in seconds, used to derive heights.
pub const DEFAULT_BLOCK_INTERVAL_SECS: u64 = 12;

/// Wall-clock environment for hosts that are not a blockchain.
///
/// Time is read from the system clock and clamped to the highest value ever
/// returned, so a wall-clock step backwards never produces a smaller
/// timestamp.  Height is `anchor_height + (now - anchor_time) / interval`.
pub struct SystemEnv {
    anchor_time: u64,
    anchor_height: u64,
    block_interval: u64,
    high_water: AtomicU64,
}

impl SystemEnv {
    /// Anchor a fresh environment at the current wall-clock time, height 0.
    pub fn new(block_interval: u64) -> Self {
        Self::anchored(wall_clock_secs(), 0, block_interval)
    }

    /// Anchor at a known `(time, height)` pair, e.g. a persisted
    /// deployment record, so heights keep counting from there.
    ///
    /// A zero `block_interval` is treated as one second.
    pub fn anchored(anchor_time: u64, anchor_height: u64, block_interval: u64) -> Self {
        Self {
            anchor_time,
            anchor_height,
            block_interval: block_interval.max(1),
            high_water: AtomicU64::new(anchor_time),
        }
    }
}

impl ChainEnv for SystemEnv {
    fn timestamp(&self) -> u64 {
        let now = wall_clock_secs();
        let previous = self.high_water.fetch_max(now, Ordering::SeqCst);
        previous.max(now)
    }

    fn block_height(&self) -> u64 {
        let elapsed = self.timestamp().saturating_sub(self.anchor_time);
        self.anchor_height + elapsed / self.block_interval
    }
}

fn wall_clock_secs() -> u64 {
    u64::try_from(Utc::now().timestamp()).unwrap_or(0)
}

// ────────────────────────────────────────────────────────────────────────────
// ManualEnv
// ────────────────────────────────────────────────────────────────────────────

/// Environment whose clock and height only move when told to.
///
/// Clones share the same readings, so a test can keep one handle and give
/// another to the kernel.
///
/// # Example
///
/// ```
/// use heartbeat_kernel::env::{ChainEnv, ManualEnv};
///
/// let env = ManualEnv::new(1_000, 7);
/// env.advance(10);
/// env.mine();
/// assert_eq!(env.timestamp(), 1_010);
/// assert_eq!(env.block_height(), 8);
/// ```
#[derive(Clone, Default)]
pub struct ManualEnv {
    timestamp: Arc<AtomicU64>,
    height: Arc<AtomicU64>,
}

impl ManualEnv {
    pub fn new(timestamp: u64, height: u64) -> Self {
        Self {
            timestamp: Arc::new(AtomicU64::new(timestamp)),
            height: Arc::new(AtomicU64::new(height)),
        }
    }

    /// Move the clock forward by `secs`.
    pub fn advance(&self, secs: u64) {
        self.timestamp.fetch_add(secs, Ordering::SeqCst);
    }

    /// Produce one block.
    pub fn mine(&self) {
        self.height.fetch_add(1, Ordering::SeqCst);
    }

    /// Force the clock to `timestamp`, including backwards.  Only useful for
    /// exercising invariant checks.
    pub fn set_timestamp(&self, timestamp: u64) {
        self.timestamp.store(timestamp, Ordering::SeqCst);
    }
}

impl ChainEnv for ManualEnv {
    fn timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::SeqCst)
    }

    fn block_height(&self) -> u64 {
        self.height.load(Ordering::SeqCst)
    }
}
