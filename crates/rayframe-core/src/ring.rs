//! Four-slot frame-buffer ring.
//!
//! Zero-copy hand-off between the capture producer and the send/consume
//! side. Buffers are pre-allocated once for the maximum geometry and move in
//! and out of RAII guards as `Box<[u8]>` — acquiring a slot moves its buffer
//! into the guard, committing or releasing moves it back. No per-frame
//! allocation, no aliasing.
//!
//! Overflow discipline: the producer never blocks. When no slot is FREE,
//! [`FrameRing::acquire_fill`] evicts the READY slot with the oldest
//! admission ticket, discarding that frame and counting it dropped. Only
//! when the consumer holds all four slots (everything SENDING) does the
//! call fail, and then the *incoming* frame is the one the caller discards.
//!
//! Slot state transitions happen under one small mutex that is never held
//! across I/O or `.await`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rayframe_proto::BitDepth;
use tokio::sync::Notify;

use crate::{RingCounters, error::RingError};

/// Number of slots in the ring.
pub const RING_SLOTS: usize = 4;

/// Metadata travelling with a committed slot.
#[derive(Debug, Clone, Copy)]
pub struct SlotMeta {
    /// Producer-assigned frame index
    pub frame_seq: u32,
    /// Capture timestamp, microseconds
    pub timestamp_us: u64,
    /// Frame width in pixels
    pub width: u16,
    /// Frame height in pixels
    pub height: u16,
    /// Pixel depth
    pub bit_depth: BitDepth,
    /// Valid byte count within the slot buffer (`width * height * 2`)
    pub len: usize,
    /// Frame flagged degraded by the producer
    pub degraded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Filling,
    Ready,
    Sending,
}

struct Slot {
    state: SlotState,
    /// Present unless loaned out through a guard.
    buf: Option<Box<[u8]>>,
    /// Admission ticket; orders eviction and consumption.
    ticket: u64,
    meta: Option<SlotMeta>,
}

struct RingInner {
    slots: [Slot; RING_SLOTS],
    next_ticket: u64,
}

impl RingInner {
    /// Index of the slot with the smallest ticket in `state`, if any.
    fn oldest_in(&self, state: SlotState) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == state)
            .min_by_key(|(_, s)| s.ticket)
            .map(|(idx, _)| idx)
    }
}

/// The four-slot ring.
///
/// # Invariants
///
/// - Every slot is in exactly one state; the state counts always sum to
///   [`RING_SLOTS`].
/// - At most one slot is FILLING at any time (single producer holding at
///   most one [`FillSlot`]; an abandoned guard frees its slot on drop).
/// - A slot's buffer is either inside the ring or inside exactly one guard.
pub struct FrameRing {
    inner: Mutex<RingInner>,
    ready_notify: Notify,
    counters: Arc<RingCounters>,
}

impl FrameRing {
    /// Create a ring whose slot buffers each hold `buf_len` bytes.
    ///
    /// `buf_len` is sized once for the maximum configured geometry
    /// (`max_width * max_height * 2`); reconfiguring geometry rebuilds the
    /// ring.
    #[must_use]
    pub fn new(buf_len: usize, counters: Arc<RingCounters>) -> Arc<Self> {
        let slots = std::array::from_fn(|_| Slot {
            state: SlotState::Free,
            buf: Some(vec![0u8; buf_len].into_boxed_slice()),
            ticket: 0,
            meta: None,
        });

        Arc::new(Self {
            inner: Mutex::new(RingInner { slots, next_ticket: 0 }),
            ready_notify: Notify::new(),
            counters,
        })
    }

    /// Acquire a slot for filling. Never blocks.
    ///
    /// Preference order: a FREE slot, else the oldest READY slot (its frame
    /// is discarded and counted dropped).
    ///
    /// # Errors
    ///
    /// - [`RingError::Exhausted`] when the consumer holds every slot; the
    ///   caller drops the incoming frame and accounts for it.
    pub fn acquire_fill(self: &Arc<Self>) -> Result<FillSlot, RingError> {
        let mut inner = self.lock();

        let mut evicted = false;
        let idx = match inner.slots.iter().position(|s| s.state == SlotState::Free) {
            Some(idx) => idx,
            None => {
                let Some(idx) = inner.oldest_in(SlotState::Ready) else {
                    return Err(RingError::Exhausted);
                };
                self.counters.incr_frames_dropped();
                tracing::debug!(slot = idx, "ring overflow, dropping oldest ready frame");
                evicted = true;
                idx
            },
        };

        let ticket = inner.next_ticket;
        inner.next_ticket += 1;

        let slot = &mut inner.slots[idx];
        slot.state = SlotState::Filling;
        slot.ticket = ticket;
        slot.meta = None;
        let buf = slot.buf.take().unwrap_or_else(|| unreachable!("free/ready slot owns its buffer"));

        Ok(FillSlot { ring: Arc::clone(self), idx, buf: Some(buf), committed: false, evicted })
    }

    /// Acquire the oldest READY slot for sending, waiting up to `timeout`.
    ///
    /// Slots come out in the admission order their `commit` happened,
    /// irrespective of frame sequence — the reassembler already resolved
    /// packet reordering upstream.
    ///
    /// # Errors
    ///
    /// - [`RingError::Empty`] if nothing became READY within `timeout`
    pub async fn acquire_send(self: &Arc<Self>, timeout: Duration) -> Result<SendSlot, RingError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.ready_notify.notified();

            if let Some(slot) = self.try_acquire_send() {
                return Ok(slot);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                // Timed out; one last check in case READY raced the deadline.
                return self.try_acquire_send().ok_or(RingError::Empty);
            }
        }
    }

    /// Non-blocking variant of [`FrameRing::acquire_send`].
    #[must_use]
    pub fn try_acquire_send(self: &Arc<Self>) -> Option<SendSlot> {
        let mut inner = self.lock();
        let idx = inner.oldest_in(SlotState::Ready)?;

        let slot = &mut inner.slots[idx];
        slot.state = SlotState::Sending;
        let buf = slot.buf.take().unwrap_or_else(|| unreachable!("ready slot owns its buffer"));
        let meta = slot.meta.unwrap_or_else(|| unreachable!("ready slot carries meta"));

        Some(SendSlot { ring: Arc::clone(self), idx, buf: Some(buf), meta, released: false })
    }

    /// Counts of (free, filling, ready, sending) slots. Test and health use.
    #[must_use]
    pub fn state_census(&self) -> (usize, usize, usize, usize) {
        let inner = self.lock();
        let count = |state| inner.slots.iter().filter(|s| s.state == state).count();
        (
            count(SlotState::Free),
            count(SlotState::Filling),
            count(SlotState::Ready),
            count(SlotState::Sending),
        )
    }

    /// Force every slot back to FREE (shutdown path). Outstanding guards
    /// still return their buffers on drop.
    pub fn reset(&self) {
        let mut inner = self.lock();
        for slot in &mut inner.slots {
            if slot.buf.is_some() {
                slot.state = SlotState::Free;
                slot.meta = None;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RingInner> {
        // Slot-table mutations never panic, so poisoning cannot occur.
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn finish_fill(&self, idx: usize, buf: Box<[u8]>, meta: Option<SlotMeta>) {
        let mut inner = self.lock();
        let slot = &mut inner.slots[idx];
        slot.buf = Some(buf);
        match meta {
            Some(meta) => {
                slot.state = SlotState::Ready;
                slot.meta = Some(meta);
                drop(inner);
                self.counters.incr_frames_received();
                self.ready_notify.notify_one();
            },
            None => {
                slot.state = SlotState::Free;
                slot.meta = None;
            },
        }
    }

    fn finish_send(&self, idx: usize, buf: Box<[u8]>, released: bool) {
        let mut inner = self.lock();
        let slot = &mut inner.slots[idx];
        slot.buf = Some(buf);
        slot.state = SlotState::Free;
        slot.meta = None;
        drop(inner);

        if released {
            self.counters.incr_frames_sent();
        } else {
            // Consumer abandoned the slot mid-send.
            self.counters.incr_frames_dropped();
        }
    }
}

impl std::fmt::Debug for FrameRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (free, filling, ready, sending) = self.state_census();
        f.debug_struct("FrameRing")
            .field("free", &free)
            .field("filling", &filling)
            .field("ready", &ready)
            .field("sending", &sending)
            .finish()
    }
}

/// Exclusive hold on a FILLING slot.
///
/// Write pixel bytes through [`FillSlot::buf_mut`], then [`FillSlot::commit`]
/// to publish. Dropping without committing returns the slot to FREE without
/// touching any counter.
pub struct FillSlot {
    ring: Arc<FrameRing>,
    idx: usize,
    buf: Option<Box<[u8]>>,
    committed: bool,
    evicted: bool,
}

impl FillSlot {
    /// Mutable view of the slot buffer.
    pub fn buf_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or_else(|| unreachable!("buffer present until drop"))
    }

    /// Whether acquiring this slot discarded an older READY frame.
    ///
    /// The producer uses this to flag the next outgoing frame degraded.
    #[must_use]
    pub fn evicted_frame(&self) -> bool {
        self.evicted
    }

    /// Publish the slot as READY with `meta` describing the valid bytes.
    /// Increments `frames_received` and wakes the consumer.
    pub fn commit(mut self, meta: SlotMeta) {
        self.committed = true;
        let buf = self.buf.take().unwrap_or_else(|| unreachable!("buffer present until drop"));
        self.ring.finish_fill(self.idx, buf, Some(meta));
    }
}

impl Drop for FillSlot {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            debug_assert!(!self.committed);
            self.ring.finish_fill(self.idx, buf, None);
        }
    }
}

impl std::fmt::Debug for FillSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FillSlot").field("idx", &self.idx).finish_non_exhaustive()
    }
}

/// Exclusive hold on a SENDING slot.
///
/// Read the frame through [`SendSlot::data`]; call [`SendSlot::release`]
/// after a successful hand-off (counts `frames_sent`). Dropping without
/// releasing frees the slot but counts the frame dropped.
pub struct SendSlot {
    ring: Arc<FrameRing>,
    idx: usize,
    buf: Option<Box<[u8]>>,
    meta: SlotMeta,
    released: bool,
}

impl SendSlot {
    /// Frame metadata recorded at commit.
    #[must_use]
    pub fn meta(&self) -> &SlotMeta {
        &self.meta
    }

    /// The valid frame bytes (`meta.len` of them).
    #[must_use]
    pub fn data(&self) -> &[u8] {
        let buf = self.buf.as_deref().unwrap_or_else(|| unreachable!("buffer present until drop"));
        &buf[..self.meta.len]
    }

    /// Mark the frame fully handed off and free the slot.
    pub fn release(mut self) {
        self.released = true;
        let buf = self.buf.take().unwrap_or_else(|| unreachable!("buffer present until drop"));
        self.ring.finish_send(self.idx, buf, true);
    }
}

impl Drop for SendSlot {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            debug_assert!(!self.released);
            self.ring.finish_send(self.idx, buf, false);
        }
    }
}

impl std::fmt::Debug for SendSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendSlot")
            .field("idx", &self.idx)
            .field("frame_seq", &self.meta.frame_seq)
            .finish_non_exhaustive()
    }
}
