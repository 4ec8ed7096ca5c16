//! Multi-slot packet reassembly.
//!
//! Rebuilds frames from data packets that may arrive out of order,
//! duplicated, or not at all. One slot per in-flight `frame_seq`; slots are
//! evicted when the table is full (oldest first) or when they outlive the
//! configured timeout.
//!
//! Pure logic: the caller injects `Instant`s, so eviction is deterministic
//! in tests. The table is owned by the single decode task — no locking.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rayframe_proto::{BitDepth, FramePacket, MAX_PAYLOAD};

use crate::{Frame, RingCounters};

/// Reassembler tuning.
#[derive(Debug, Clone)]
pub struct ReassemblyConfig {
    /// Maximum concurrently open slots (2..=32)
    pub max_slots: usize,
    /// Age at which an incomplete slot is evicted
    pub timeout: Duration,
    /// Emit zero-filled degraded frames for timed-out slots instead of
    /// dropping them silently
    pub emit_partial_on_timeout: bool,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self { max_slots: 8, timeout: Duration::from_millis(2000), emit_partial_on_timeout: false }
    }
}

/// Geometry template fixed by the first packet seen for a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SlotTemplate {
    width: u16,
    height: u16,
    bit_depth: BitDepth,
    total_packets: u16,
    timestamp_us: u64,
}

/// Per-frame assembly state.
struct Slot {
    template: SlotTemplate,
    /// One flag per packet index.
    received: Vec<bool>,
    /// `total_packets * MAX_PAYLOAD`, trimmed to the frame size on emit.
    buffer: Vec<u8>,
    received_count: u16,
    created_at: Instant,
    /// Producer flagged the frame degraded on some packet.
    error_flagged: bool,
}

impl Slot {
    fn new(template: SlotTemplate, created_at: Instant) -> Self {
        let total = usize::from(template.total_packets);
        Self {
            template,
            received: vec![false; total],
            buffer: vec![0u8; total * MAX_PAYLOAD],
            received_count: 0,
            created_at,
            error_flagged: false,
        }
    }

    fn frame_bytes(&self) -> usize {
        usize::from(self.template.width) * usize::from(self.template.height) * 2
    }

    fn into_frame(self, frame_seq: u32, degraded: bool) -> Frame {
        let len = self.frame_bytes();
        Frame::from_le_bytes(
            frame_seq,
            self.template.timestamp_us,
            self.template.width,
            self.template.height,
            self.template.bit_depth,
            degraded,
            &self.buffer[..len],
        )
    }
}

/// The reassembly table.
pub struct Reassembler {
    config: ReassemblyConfig,
    slots: HashMap<u32, Slot>,
    counters: Arc<RingCounters>,
}

impl Reassembler {
    /// Create an empty table.
    #[must_use]
    pub fn new(config: ReassemblyConfig, counters: Arc<RingCounters>) -> Self {
        Self { config, slots: HashMap::new(), counters }
    }

    /// Number of currently open slots.
    #[must_use]
    pub fn open_slots(&self) -> usize {
        self.slots.len()
    }

    /// Update the timeout/partial-emission knobs (hot configuration).
    pub fn set_timeout(&mut self, timeout: Duration, emit_partial: bool) {
        self.config.timeout = timeout;
        self.config.emit_partial_on_timeout = emit_partial;
    }

    /// Feed one validated packet; returns the finished frame if this packet
    /// completed it.
    ///
    /// Rejections (inconsistent header, wrong-size payload, geometry
    /// mismatch against the slot) increment `crc_errors` and return `None`.
    /// Duplicates are dropped silently.
    pub fn process(&mut self, packet: &FramePacket, now: Instant) -> Option<Frame> {
        let header = &packet.header;
        let frame_seq = header.frame_seq();
        let index = header.packet_index();
        let total = header.total_packets();

        let Some(template) = Self::validate(packet) else {
            self.counters.incr_crc_errors();
            tracing::debug!(
                frame_seq,
                packet_index = index,
                error_kind = "inconsistent_header",
                "rejecting packet"
            );
            return None;
        };

        if !self.slots.contains_key(&frame_seq) {
            if self.slots.len() >= self.config.max_slots {
                self.evict_oldest(now);
            }
            self.slots.insert(frame_seq, Slot::new(template, now));
        }

        // Table entry exists past this point; look it up fresh because the
        // eviction above may have shuffled the map.
        let slot = self.slots.get_mut(&frame_seq)?;

        if slot.template != template {
            self.counters.incr_crc_errors();
            tracing::debug!(
                frame_seq,
                packet_index = index,
                error_kind = "geometry_mismatch",
                "rejecting packet against first-seen geometry"
            );
            return None;
        }

        if slot.received[usize::from(index)] {
            // Duplicate: idempotent, no counter.
            return None;
        }

        let offset = usize::from(index) * MAX_PAYLOAD;
        slot.buffer[offset..offset + packet.payload.len()].copy_from_slice(&packet.payload);
        slot.received[usize::from(index)] = true;
        slot.received_count += 1;
        if header.flags().error_frame() {
            slot.error_flagged = true;
        }

        if slot.received_count == total {
            let slot = self.slots.remove(&frame_seq)?;
            let degraded = slot.error_flagged;
            return Some(slot.into_frame(frame_seq, degraded));
        }

        None
    }

    /// Evict slots older than the configured timeout.
    ///
    /// Returns partial frames for the evicted slots when
    /// `emit_partial_on_timeout` is set (missing regions zero-filled and the
    /// frame marked degraded); otherwise the vec is empty. Either way each
    /// eviction counts one `reassembly_timeouts`.
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<Frame> {
        let expired: Vec<u32> = self
            .slots
            .iter()
            .filter(|(_, slot)| now.duration_since(slot.created_at) > self.config.timeout)
            .map(|(&seq, _)| seq)
            .collect();

        let mut partials = Vec::new();
        for frame_seq in expired {
            let Some(slot) = self.slots.remove(&frame_seq) else { continue };
            self.counters.incr_reassembly_timeouts();
            tracing::warn!(
                frame_seq,
                received = slot.received_count,
                total = slot.template.total_packets,
                error_kind = "reassembly_timeout",
                reason = "timeout",
                "evicting incomplete frame"
            );

            if self.config.emit_partial_on_timeout && slot.received_count > 0 {
                partials.push(slot.into_frame(frame_seq, true));
            }
        }
        partials
    }

    /// Drop every open slot (scan stop / shutdown). No counters, no frames.
    pub fn clear(&mut self) {
        self.slots.clear();
    }

    /// Header consistency checks; returns the slot template when the packet
    /// is plausible on its own.
    fn validate(packet: &FramePacket) -> Option<SlotTemplate> {
        let header = &packet.header;
        let total = header.total_packets();
        let index = header.packet_index();

        if total == 0 || index >= total {
            return None;
        }

        let bit_depth = header.bit_depth()?;

        let frame_bytes = usize::from(header.width()) * usize::from(header.height()) * 2;
        if frame_bytes == 0 {
            return None;
        }

        let expected_total = frame_bytes.div_ceil(MAX_PAYLOAD);
        if usize::from(total) != expected_total {
            return None;
        }

        // Every packet is full-size except the last, which carries the
        // remainder (and must say so in its flags).
        let is_last = usize::from(index) == expected_total - 1;
        let expected_len = if is_last {
            frame_bytes - (expected_total - 1) * MAX_PAYLOAD
        } else {
            MAX_PAYLOAD
        };
        if packet.payload.len() != expected_len {
            return None;
        }
        if is_last != header.flags().last_packet() {
            return None;
        }

        Some(SlotTemplate {
            width: header.width(),
            height: header.height(),
            bit_depth,
            total_packets: total,
            timestamp_us: header.timestamp_us(),
        })
    }

    /// Evict the slot with the earliest admission (slot pressure).
    fn evict_oldest(&mut self, _now: Instant) {
        let Some(oldest) = self
            .slots
            .iter()
            .min_by_key(|(_, slot)| slot.created_at)
            .map(|(&seq, _)| seq)
        else {
            return;
        };

        if let Some(slot) = self.slots.remove(&oldest) {
            self.counters.incr_reassembly_timeouts();
            tracing::warn!(
                frame_seq = oldest,
                received = slot.received_count,
                total = slot.template.total_packets,
                error_kind = "reassembly_timeout",
                reason = "pressure",
                "evicting oldest slot under pressure"
            );
        }
    }
}

impl std::fmt::Debug for Reassembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reassembler")
            .field("open_slots", &self.slots.len())
            .field("max_slots", &self.config.max_slots)
            .field("timeout", &self.config.timeout)
            .finish()
    }
}
