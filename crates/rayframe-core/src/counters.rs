//! Process-wide pipeline statistics.
//!
//! Monotonically non-decreasing atomics, updated with `fetch_add` from any
//! task and snapshotted without locks by the control plane. The snapshot
//! reuses the wire-level [`CounterSnapshot`] so GET_STATUS responses need no
//! further conversion.

use std::sync::atomic::{AtomicU64, Ordering};

use rayframe_proto::payloads::CounterSnapshot;

/// Shared pipeline counters.
///
/// One instance per process, created at startup and handed out as
/// `Arc<RingCounters>`. Relaxed ordering everywhere: these are statistics,
/// not synchronization.
#[derive(Debug, Default)]
pub struct RingCounters {
    frames_received: AtomicU64,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    auth_failures: AtomicU64,
    crc_errors: AtomicU64,
    reassembly_timeouts: AtomicU64,
}

impl RingCounters {
    /// Fresh counters, all zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a frame entering the pipeline.
    pub fn incr_frames_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a frame leaving the pipeline successfully.
    pub fn incr_frames_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a frame discarded by overflow or send failure.
    pub fn incr_frames_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a rejected control datagram (authentication or replay).
    pub fn incr_auth_failures(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a data packet rejected for CRC or consistency errors.
    pub fn incr_crc_errors(&self) {
        self.crc_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a reassembly slot evicted on timeout or pressure.
    pub fn incr_reassembly_timeouts(&self) {
        self.reassembly_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Current frames-received count.
    #[must_use]
    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    /// Current frames-sent count.
    #[must_use]
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    /// Current frames-dropped count.
    #[must_use]
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    /// Current auth-failure count.
    #[must_use]
    pub fn auth_failures(&self) -> u64 {
        self.auth_failures.load(Ordering::Relaxed)
    }

    /// Current CRC-error count.
    #[must_use]
    pub fn crc_errors(&self) -> u64 {
        self.crc_errors.load(Ordering::Relaxed)
    }

    /// Current reassembly-timeout count.
    #[must_use]
    pub fn reassembly_timeouts(&self) -> u64 {
        self.reassembly_timeouts.load(Ordering::Relaxed)
    }

    /// Reset every counter to zero (scan-start housekeeping, when enabled).
    pub fn clear(&self) {
        self.frames_received.store(0, Ordering::Relaxed);
        self.frames_sent.store(0, Ordering::Relaxed);
        self.frames_dropped.store(0, Ordering::Relaxed);
        self.auth_failures.store(0, Ordering::Relaxed);
        self.crc_errors.store(0, Ordering::Relaxed);
        self.reassembly_timeouts.store(0, Ordering::Relaxed);
    }

    /// Lock-free snapshot in wire form.
    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            frames_received: self.frames_received(),
            frames_sent: self.frames_sent(),
            frames_dropped: self.frames_dropped(),
            auth_failures: self.auth_failures(),
            crc_errors: self.crc_errors(),
            reassembly_timeouts: self.reassembly_timeouts(),
        }
    }
}
