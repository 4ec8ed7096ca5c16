//! Property-based tests for the reassembler and the frame ring.
//!
//! The reassembler property is the load-bearing one: for any permutation of
//! a frame's packets, with arbitrary duplication mixed in, the assembled
//! frame must be byte-identical to the input. The ring property drives
//! random operation sequences and checks the state-sum invariant after
//! every step.

use std::sync::Arc;
use std::time::{Duration, Instant};

use proptest::prelude::*;
use rayframe_core::{FrameRing, Reassembler, ReassemblyConfig, RingCounters, SlotMeta};
use rayframe_proto::{BitDepth, FramePacket, MAX_PAYLOAD, PacketFlags, PacketHeader};

fn packets_for(frame_seq: u32, width: u16, height: u16, pixels: &[u8]) -> Vec<FramePacket> {
    let chunks: Vec<&[u8]> = pixels.chunks(MAX_PAYLOAD).collect();
    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let is_last = i == chunks.len() - 1;
            let flags =
                if is_last { PacketFlags::empty().with_last_packet() } else { PacketFlags::empty() };
            let header = PacketHeader::new(
                frame_seq,
                0,
                width,
                height,
                BitDepth::Sixteen,
                i as u16,
                chunks.len() as u16,
                flags,
            );
            FramePacket::new(header, chunk.to_vec()).expect("payload fits")
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Any packet order, with duplicates interleaved, assembles the exact
    /// input bytes — and nothing is emitted before the full set is seen.
    #[test]
    fn permuted_and_duplicated_packets_assemble_identically(
        seed_pixels in prop::collection::vec(any::<u8>(), 0..4),
        shuffled in Just((0..8usize).collect::<Vec<_>>()).prop_shuffle(),
        dup in 0usize..8,
        dup_pos in 0usize..=8,
    ) {
        let mut order = shuffled;
        order.insert(dup_pos, dup);
        // 256x128x16-bit = 64 KiB = exactly 8 full payloads.
        let width = 256u16;
        let height = 128u16;
        let mut pixels = vec![0u8; usize::from(width) * usize::from(height) * 2];
        for (i, byte) in pixels.iter_mut().enumerate() {
            *byte = seed_pixels.get(i % seed_pixels.len().max(1)).copied().unwrap_or(0)
                ^ (i as u8);
        }

        let packets = packets_for(9, width, height, &pixels);
        prop_assert_eq!(packets.len(), 8);

        let counters = Arc::new(RingCounters::new());
        let mut reassembler = Reassembler::new(ReassemblyConfig::default(), Arc::clone(&counters));
        let now = Instant::now();

        let mut seen = std::collections::HashSet::new();
        let mut emitted = Vec::new();
        for (step, &idx) in order.iter().enumerate() {
            let result = reassembler.process(&packets[idx], now);
            seen.insert(idx);
            if let Some(frame) = result {
                emitted.push((step, frame));
            }
        }

        prop_assert_eq!(emitted.len(), 1, "exactly one frame must come out");
        let (step, frame) = &emitted[0];
        // Emission only once all eight distinct packets had been seen.
        let distinct_by_then: std::collections::HashSet<usize> =
            order[..=*step].iter().copied().collect();
        prop_assert_eq!(distinct_by_then.len(), 8);
        prop_assert_eq!(frame.to_le_bytes(), pixels);
        prop_assert_eq!(counters.crc_errors(), 0);
    }

    /// Random fill/commit/send/release schedules keep the ring's state sum
    /// at four and never block the producer.
    #[test]
    fn ring_state_sum_invariant_under_random_ops(ops in prop::collection::vec(0u8..4, 1..200)) {
        let counters = Arc::new(RingCounters::new());
        let ring = FrameRing::new(64, Arc::clone(&counters));

        let mut fill = None;
        let mut sends = Vec::new();
        let mut seq = 0u32;

        for op in ops {
            match op {
                // acquire_fill (replacing any abandoned previous guard)
                0 => {
                    fill = ring.acquire_fill().ok();
                },
                // commit the held fill guard
                1 => {
                    if let Some(slot) = fill.take() {
                        slot.commit(SlotMeta {
                            frame_seq: seq,
                            timestamp_us: 0,
                            width: 4,
                            height: 4,
                            bit_depth: BitDepth::Sixteen,
                            len: 32,
                            degraded: false,
                        });
                        seq += 1;
                    }
                },
                // try_acquire_send, holding the guard
                2 => {
                    if let Some(slot) = ring.try_acquire_send() {
                        sends.push(slot);
                    }
                },
                // release the oldest held send guard
                _ => {
                    if !sends.is_empty() {
                        sends.remove(0).release();
                    }
                },
            }

            let (free, filling, ready, sending) = ring.state_census();
            prop_assert_eq!(free + filling + ready + sending, 4);
            prop_assert!(filling <= 1, "at most one slot FILLING");
        }

        drop(fill);
        drop(sends);

        // Accounting: everything received either left, dropped, or is READY.
        let (_, _, ready, _) = ring.state_census();
        prop_assert_eq!(
            counters.frames_received(),
            counters.frames_sent() + counters.frames_dropped() + ready as u64
        );
    }
}

#[test]
fn max_geometry_packet_count() {
    // 4096x4096x16-bit at 8 KiB payloads: exactly 4096 packets.
    let frame_bytes = 4096usize * 4096 * 2;
    assert_eq!(frame_bytes.div_ceil(MAX_PAYLOAD), 4096);

    // Slot sizing at that geometry: sparse packets land at stable offsets.
    let counters = Arc::new(RingCounters::new());
    let mut reassembler = Reassembler::new(
        ReassemblyConfig { max_slots: 2, ..Default::default() },
        counters,
    );
    let now = Instant::now();

    let first = PacketHeader::new(
        0,
        0,
        4096,
        4096,
        BitDepth::Sixteen,
        0,
        4096,
        PacketFlags::empty(),
    );
    let last = PacketHeader::new(
        0,
        0,
        4096,
        4096,
        BitDepth::Sixteen,
        4095,
        4096,
        PacketFlags::empty().with_last_packet(),
    );

    let first = FramePacket::new(first, vec![0x11u8; MAX_PAYLOAD]).expect("fits");
    let last = FramePacket::new(last, vec![0x22u8; MAX_PAYLOAD]).expect("fits");

    assert!(reassembler.process(&first, now).is_none());
    assert!(reassembler.process(&last, now).is_none());
    assert_eq!(reassembler.open_slots(), 1);

    // Evicted silently under the default policy once it times out.
    let partials = reassembler.sweep_expired(now + Duration::from_secs(10));
    assert!(partials.is_empty());
    assert_eq!(reassembler.open_slots(), 0);
}
