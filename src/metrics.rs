//! Runtime counters for server and session activity.
//!
//! This is a plain counter registry behind an explicit, cloneable handle —
//! not a global singleton and not an exporter. Wiring these numbers up to
//! Prometheus or any other backend is left to the embedder.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct Counters {
    connections_accepted: AtomicU64,
    connections_active: AtomicU64,
    connections_rejected: AtomicU64,
    auth_failures: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    frames_sent: AtomicU64,
    rectangles_sent: AtomicU64,
    full_refreshes: AtomicU64,
}

/// A cheap-to-clone handle onto a shared set of atomic counters.
///
/// Construct one with [`Metrics::new`] and share it explicitly between the
/// server and its sessions; there is no process-wide instance to reach for.
#[derive(Clone, Default)]
pub struct Metrics {
    counters: Arc<Counters>,
}

impl Metrics {
    /// Creates a fresh, zeroed counter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a newly accepted connection.
    pub fn record_connection_accepted(&self) {
        self.counters.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.counters.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a connection closing, whether cleanly or on error.
    pub fn record_connection_closed(&self) {
        self.counters.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Records a connection rejected for exceeding `max_connections`.
    pub fn record_connection_rejected(&self) {
        self.counters.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed authentication attempt.
    pub fn record_auth_failure(&self) {
        self.counters.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds to the running total of bytes written to clients.
    pub fn add_bytes_sent(&self, n: u64) {
        self.counters.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    /// Adds to the running total of bytes read from clients.
    pub fn add_bytes_received(&self, n: u64) {
        self.counters.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    /// Records one `FramebufferUpdate` message sent, covering `n` rectangles.
    pub fn record_frame_sent(&self, rectangles: u64) {
        self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.counters.rectangles_sent.fetch_add(rectangles, Ordering::Relaxed);
    }

    /// Records a change-detector fallback to a full-frame refresh.
    pub fn record_full_refresh(&self) {
        self.counters.full_refreshes.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time snapshot of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_accepted: self.counters.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.counters.connections_active.load(Ordering::Relaxed),
            connections_rejected: self.counters.connections_rejected.load(Ordering::Relaxed),
            auth_failures: self.counters.auth_failures.load(Ordering::Relaxed),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            frames_sent: self.counters.frames_sent.load(Ordering::Relaxed),
            rectangles_sent: self.counters.rectangles_sent.load(Ordering::Relaxed),
            full_refreshes: self.counters.full_refreshes.load(Ordering::Relaxed),
        }
    }
}

/// Immutable point-in-time read of a [`Metrics`] handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Total connections accepted since startup.
    pub connections_accepted: u64,
    /// Connections currently open.
    pub connections_active: u64,
    /// Connections rejected for exceeding `max_connections`.
    pub connections_rejected: u64,
    /// Total failed authentication attempts.
    pub auth_failures: u64,
    /// Total bytes written to clients.
    pub bytes_sent: u64,
    /// Total bytes read from clients.
    pub bytes_received: u64,
    /// Total `FramebufferUpdate` messages sent.
    pub frames_sent: u64,
    /// Total rectangles sent across all updates.
    pub rectangles_sent: u64,
    /// Total change-detector fallbacks to a full-frame refresh.
    pub full_refreshes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let metrics = Metrics::new();
        let snap = metrics.snapshot();
        assert_eq!(snap, MetricsSnapshot::default());
    }

    #[test]
    fn clone_shares_the_same_counters() {
        let metrics = Metrics::new();
        let clone = metrics.clone();
        metrics.record_connection_accepted();
        assert_eq!(clone.snapshot().connections_active, 1);
    }

    #[test]
    fn closed_connection_decrements_active() {
        let metrics = Metrics::new();
        metrics.record_connection_accepted();
        metrics.record_connection_closed();
        assert_eq!(metrics.snapshot().connections_active, 0);
        assert_eq!(metrics.snapshot().connections_accepted, 1);
    }
}
