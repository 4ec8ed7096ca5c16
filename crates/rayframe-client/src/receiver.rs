//! Frame reception pipeline: socket → intake queue → decode → reassemble →
//! ring.
//!
//! Two tasks decouple network scheduling jitter from decode latency. The
//! receive task does nothing but move datagrams into a bounded queue
//! (oldest-drop on overflow, like the ring); the decode task validates
//! headers, feeds the reassembler, and stages completed frames through the
//! frame ring for the consumer.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rayframe_core::{Frame, FrameRing, Reassembler, RingCounters, SlotMeta};
use rayframe_proto::FramePacket;
use tokio::net::UdpSocket;
use tokio::sync::{Notify, watch};

/// Intake queue capacity in datagrams.
pub const INTAKE_CAPACITY: usize = 4096;

/// How often the decode task sweeps expired reassembly slots.
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Bounded datagram queue with oldest-drop overflow.
///
/// Push never blocks: at capacity, the oldest queued datagram is discarded
/// to make room, preserving liveness under receive bursts.
pub(crate) struct IntakeQueue {
    inner: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
    capacity: usize,
}

impl IntakeQueue {
    pub(crate) fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
        })
    }

    /// Queue a datagram, discarding the oldest if full. Returns whether a
    /// datagram was discarded.
    pub(crate) fn push(&self, datagram: Vec<u8>) -> bool {
        let mut inner = self.lock();
        let mut dropped = false;
        if inner.len() == self.capacity {
            inner.pop_front();
            dropped = true;
        }
        inner.push_back(datagram);
        drop(inner);
        self.notify.notify_one();
        dropped
    }

    /// Wait for the next datagram.
    pub(crate) async fn pop(&self) -> Vec<u8> {
        loop {
            let notified = self.notify.notified();
            if let Some(datagram) = self.lock().pop_front() {
                return datagram;
            }
            notified.await;
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Vec<u8>>> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Receive task: drain the data socket into the intake queue.
pub(crate) async fn recv_task(
    socket: Arc<UdpSocket>,
    queue: Arc<IntakeQueue>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; 65536];
    loop {
        let len = tokio::select! {
            result = socket.recv_from(&mut buf) => match result {
                Ok((len, _)) => len,
                Err(err) => {
                    tracing::warn!(error_kind = "recv", "data socket error: {err}");
                    continue;
                },
            },
            _ = shutdown.changed() => break,
        };

        if queue.push(buf[..len].to_vec()) {
            tracing::debug!(error_kind = "intake_overflow", "intake queue dropped oldest datagram");
        }
    }
    tracing::debug!("recv task exiting");
}

/// Decode task: validate, reassemble, stage into the ring.
pub(crate) async fn decode_task(
    queue: Arc<IntakeQueue>,
    mut reassembler: Reassembler,
    ring: Arc<FrameRing>,
    counters: Arc<RingCounters>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            datagram = queue.pop() => {
                let packet = match FramePacket::decode(&datagram) {
                    Ok(packet) => packet,
                    Err(err) => {
                        // Bad magic, length or CRC: count and move on.
                        counters.incr_crc_errors();
                        tracing::debug!(error_kind = %err, "discarding data datagram");
                        continue;
                    },
                };

                if let Some(frame) = reassembler.process(&packet, Instant::now()) {
                    stage_frame(&ring, &counters, &frame);
                }
            },
            _ = sweep.tick() => {
                for partial in reassembler.sweep_expired(Instant::now()) {
                    stage_frame(&ring, &counters, &partial);
                }
            },
            _ = shutdown.changed() => break,
        }
    }
    tracing::debug!("decode task exiting");
}

/// Stage a completed frame through the ring for the consumer.
fn stage_frame(ring: &Arc<FrameRing>, counters: &Arc<RingCounters>, frame: &Frame) {
    let bytes = frame.to_le_bytes();

    let mut slot = match ring.acquire_fill() {
        Ok(slot) => slot,
        Err(_) => {
            // Consumer holds every slot; this frame is lost here.
            counters.incr_frames_received();
            counters.incr_frames_dropped();
            tracing::warn!(
                frame_seq = frame.sequence,
                error_kind = "ring_overflow",
                "ring exhausted, assembled frame lost"
            );
            return;
        },
    };

    let len = bytes.len().min(slot.buf_mut().len());
    slot.buf_mut()[..len].copy_from_slice(&bytes[..len]);
    slot.commit(SlotMeta {
        frame_seq: frame.sequence,
        timestamp_us: frame.timestamp_us,
        width: frame.width,
        height: frame.height,
        bit_depth: frame.bit_depth,
        len,
        degraded: frame.degraded,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intake_queue_drops_oldest_on_overflow() {
        let queue = IntakeQueue::new(3);
        assert!(!queue.push(vec![1]));
        assert!(!queue.push(vec![2]));
        assert!(!queue.push(vec![3]));
        assert!(queue.push(vec![4]), "overflow must report the drop");
        assert_eq!(queue.len(), 3);
    }

    #[tokio::test]
    async fn intake_queue_pops_in_fifo_order() {
        let queue = IntakeQueue::new(8);
        queue.push(vec![1]);
        queue.push(vec![2]);

        assert_eq!(queue.pop().await, vec![1]);
        assert_eq!(queue.pop().await, vec![2]);
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let queue = IntakeQueue::new(8);
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(vec![7]);
        assert_eq!(waiter.await.expect("join"), vec![7]);
    }
}
