//! Fragmenting UDP sender for the data path.
//!
//! One frame becomes `ceil(len / MAX_PAYLOAD)` datagrams with sequential
//! packet indices; the last one carries the last-packet flag. The whole
//! frame should leave within one frame period — overruns log a backpressure
//! warning but transmission continues, matching the "never stall the
//! producer" discipline.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};
use rayframe_core::SendSlot;
use rayframe_proto::{MAX_PAYLOAD, PacketFlags, PacketHeader};
use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::error::DeviceError;

/// Transmit retries per packet on transient socket errors.
pub const SEND_RETRIES_PER_PACKET: u32 = 3;

/// How a frame transmission ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Every packet left the socket
    Complete,
    /// A stop/shutdown request interrupted transmission after an in-flight
    /// packet; the remainder of the frame was abandoned
    Interrupted,
}

/// The data-path sender.
pub struct FrameSender {
    socket: Arc<UdpSocket>,
}

impl FrameSender {
    /// Sender over an already-bound socket.
    #[must_use]
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }

    /// Fragment and transmit one ring slot to `dest`.
    ///
    /// `stop` is sampled between packets: a pending stop finishes the
    /// in-flight packet, then abandons the rest of the frame
    /// ([`SendOutcome::Interrupted`]).
    ///
    /// # Errors
    ///
    /// - [`DeviceError::Transport`] when a packet exhausts its retries; the
    ///   caller drops the frame and its slot
    pub async fn send_frame(
        &self,
        slot: &SendSlot,
        dest: SocketAddr,
        frame_period: Duration,
        stop: &watch::Receiver<bool>,
    ) -> Result<SendOutcome, DeviceError> {
        let meta = slot.meta();
        let data = slot.data();
        let total = u16::try_from(data.len().div_ceil(MAX_PAYLOAD))
            .map_err(|_| DeviceError::Transport("frame exceeds u16 packet count".to_string()))?;

        let base_flags = if meta.degraded {
            PacketFlags::empty().with_error_frame()
        } else {
            PacketFlags::empty()
        };

        let started = Instant::now();
        let mut wire = BytesMut::with_capacity(PacketHeader::SIZE + MAX_PAYLOAD);

        for (index, chunk) in data.chunks(MAX_PAYLOAD).enumerate() {
            let index = index as u16;
            let flags = if index + 1 == total { base_flags.with_last_packet() } else { base_flags };

            let header = PacketHeader::new(
                meta.frame_seq,
                meta.timestamp_us,
                meta.width,
                meta.height,
                meta.bit_depth,
                index,
                total,
                flags,
            );

            wire.clear();
            wire.put_slice(&header.to_bytes());
            wire.put_slice(chunk);

            self.send_with_retries(&wire, dest, meta.frame_seq, index).await?;

            if *stop.borrow() {
                tracing::info!(
                    frame_seq = meta.frame_seq,
                    packet_index = index,
                    "stop requested, abandoning remainder of frame"
                );
                return Ok(SendOutcome::Interrupted);
            }
        }

        let elapsed = started.elapsed();
        if elapsed > frame_period {
            tracing::warn!(
                frame_seq = meta.frame_seq,
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = frame_period.as_millis() as u64,
                error_kind = "backpressure",
                "frame transmission exceeded its period"
            );
        }

        Ok(SendOutcome::Complete)
    }

    async fn send_with_retries(
        &self,
        wire: &[u8],
        dest: SocketAddr,
        frame_seq: u32,
        packet_index: u16,
    ) -> Result<(), DeviceError> {
        let mut attempt = 0;
        loop {
            match self.socket.send_to(wire, dest).await {
                Ok(_) => return Ok(()),
                Err(err) if attempt < SEND_RETRIES_PER_PACKET => {
                    attempt += 1;
                    tracing::warn!(
                        frame_seq,
                        packet_index,
                        attempt,
                        error_kind = "send_retry",
                        "packet send failed: {err}"
                    );
                },
                Err(err) => {
                    return Err(DeviceError::Transport(format!(
                        "packet {packet_index} of frame {frame_seq} failed after retries: {err}"
                    )));
                },
            }
        }
    }
}

impl std::fmt::Debug for FrameSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSender").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use rayframe_core::{FrameRing, RingCounters, SlotMeta};
    use rayframe_proto::{BitDepth, FramePacket};

    use super::*;

    async fn socket_pair() -> (Arc<UdpSocket>, UdpSocket) {
        let sender = UdpSocket::bind("127.0.0.1:0").await.expect("bind sender");
        let receiver = UdpSocket::bind("127.0.0.1:0").await.expect("bind receiver");
        (Arc::new(sender), receiver)
    }

    fn committed_slot(frame_bytes: usize, frame_seq: u32) -> SendSlot {
        let counters = Arc::new(RingCounters::new());
        let ring = FrameRing::new(frame_bytes, counters);

        let mut fill = ring.acquire_fill().expect("free slot");
        for (i, byte) in fill.buf_mut().iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        fill.commit(SlotMeta {
            frame_seq,
            timestamp_us: 123_456,
            width: 128,
            height: 128,
            bit_depth: BitDepth::Sixteen,
            len: frame_bytes,
            degraded: false,
        });
        ring.try_acquire_send().expect("ready slot")
    }

    #[tokio::test]
    async fn frame_fragments_with_sequential_indices() {
        let (sender_socket, receiver) = socket_pair().await;
        let dest = receiver.local_addr().expect("addr");
        let sender = FrameSender::new(sender_socket);
        let (_stop_tx, stop_rx) = watch::channel(false);

        // 128x128x16-bit = 32768 bytes = 4 packets.
        let slot = committed_slot(128 * 128 * 2, 9);
        let expected = slot.data().to_vec();

        let outcome = sender
            .send_frame(&slot, dest, Duration::from_secs(1), &stop_rx)
            .await
            .expect("send succeeds");
        assert_eq!(outcome, SendOutcome::Complete);
        slot.release();

        let mut buf = vec![0u8; 65536];
        let mut reassembled = vec![0u8; expected.len()];
        for expected_index in 0u16..4 {
            let (n, _) = receiver.recv_from(&mut buf).await.expect("datagram");
            let packet = FramePacket::decode(&buf[..n]).expect("decodes");

            assert_eq!(packet.header.frame_seq(), 9);
            assert_eq!(packet.header.packet_index(), expected_index);
            assert_eq!(packet.header.total_packets(), 4);
            assert_eq!(packet.header.flags().last_packet(), expected_index == 3);
            assert!(!packet.header.flags().error_frame());

            let offset = usize::from(expected_index) * MAX_PAYLOAD;
            reassembled[offset..offset + packet.payload.len()].copy_from_slice(&packet.payload);
        }

        assert_eq!(reassembled, expected);
    }

    #[tokio::test]
    async fn degraded_frames_carry_error_flag() {
        let (sender_socket, receiver) = socket_pair().await;
        let dest = receiver.local_addr().expect("addr");
        let sender = FrameSender::new(sender_socket);
        let (_stop_tx, stop_rx) = watch::channel(false);

        let counters = Arc::new(RingCounters::new());
        let ring = FrameRing::new(32768, counters);
        let mut fill = ring.acquire_fill().expect("free slot");
        fill.buf_mut()[0] = 1;
        fill.commit(SlotMeta {
            frame_seq: 1,
            timestamp_us: 0,
            width: 128,
            height: 128,
            bit_depth: BitDepth::Sixteen,
            len: 32768,
            degraded: true,
        });
        let slot = ring.try_acquire_send().expect("ready");

        sender
            .send_frame(&slot, dest, Duration::from_secs(1), &stop_rx)
            .await
            .expect("send succeeds");
        slot.release();

        let mut buf = vec![0u8; 65536];
        let (n, _) = receiver.recv_from(&mut buf).await.expect("datagram");
        let packet = FramePacket::decode(&buf[..n]).expect("decodes");
        assert!(packet.header.flags().error_frame());
    }

    #[tokio::test]
    async fn stop_interrupts_after_inflight_packet() {
        let (sender_socket, receiver) = socket_pair().await;
        let dest = receiver.local_addr().expect("addr");
        let sender = FrameSender::new(sender_socket);
        let (stop_tx, stop_rx) = watch::channel(true); // already stopping
        drop(stop_tx);

        let slot = committed_slot(128 * 128 * 2, 2);
        let outcome = sender
            .send_frame(&slot, dest, Duration::from_secs(1), &stop_rx)
            .await
            .expect("send succeeds");
        assert_eq!(outcome, SendOutcome::Interrupted);

        // Exactly one packet (the in-flight one) made it out.
        let mut buf = vec![0u8; 65536];
        let (n, _) = receiver.recv_from(&mut buf).await.expect("first datagram");
        assert!(FramePacket::decode(&buf[..n]).is_ok());

        let second = tokio::time::timeout(
            Duration::from_millis(100),
            receiver.recv_from(&mut buf),
        )
        .await;
        assert!(second.is_err(), "no further packets after the interrupt");
    }
}
