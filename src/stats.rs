//! Statistics tracking for the forwarder.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters shared by all sessions.
pub struct Stats {
    pub sessions: AtomicU64,
    pub forwarded: AtomicU64,
    pub failed: AtomicU64,
    active_sessions: AtomicU64,
    /// Cumulative upstream round-trip time in microseconds for averaging.
    total_upstream_time_us: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            sessions: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            active_sessions: AtomicU64::new(0),
            total_upstream_time_us: AtomicU64::new(0),
        }
    }

    /// Count a new session. The returned guard keeps it active until dropped.
    pub fn session_started(self: &Arc<Self>) -> ActiveSession {
        self.sessions.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
        ActiveSession {
            stats: Arc::clone(self),
        }
    }

    /// Sessions currently running.
    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::Relaxed)
    }

    pub fn record_forwarded(&self, upstream_ms: f64) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        self.total_upstream_time_us
            .fetch_add((upstream_ms * 1000.0) as u64, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Take the counters accumulated since the last snapshot. The active
    /// session gauge is reported but not reset.
    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        let sessions = self.sessions.swap(0, Ordering::Relaxed);
        let forwarded = self.forwarded.swap(0, Ordering::Relaxed);
        let failed = self.failed.swap(0, Ordering::Relaxed);
        let total_us = self.total_upstream_time_us.swap(0, Ordering::Relaxed);

        let avg_upstream_ms = if forwarded > 0 {
            (total_us as f64 / forwarded as f64) / 1000.0
        } else {
            0.0
        };

        StatsSnapshot {
            sessions,
            active_sessions: self.active_sessions(),
            forwarded,
            failed,
            avg_upstream_ms,
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks one running session; decrements the gauge on drop.
pub struct ActiveSession {
    stats: Arc<Stats>,
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.stats.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct StatsSnapshot {
    pub sessions: u64,
    pub active_sessions: u64,
    pub forwarded: u64,
    pub failed: u64,
    pub avg_upstream_ms: f64,
}
