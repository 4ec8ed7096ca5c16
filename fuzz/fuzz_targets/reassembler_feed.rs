//! Fuzz target for the reassembler's packet path
//!
//! Feeds structurally arbitrary (but CRC-sealed) packets into the
//! reassembler to hunt for offset-math panics, slot-table corruption and
//! counter drift. The reassembler must reject or absorb everything.

#![no_main]

use std::sync::Arc;
use std::time::{Duration, Instant};

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use rayframe_core::{Reassembler, ReassemblyConfig, RingCounters};
use rayframe_proto::{BitDepth, FramePacket, PacketFlags, PacketHeader};

#[derive(Arbitrary, Debug)]
struct FuzzPacket {
    frame_seq: u32,
    width: u16,
    height: u16,
    sixteen_bit: bool,
    packet_index: u16,
    total_packets: u16,
    last: bool,
    payload_len: u16,
}

fuzz_target!(|packets: Vec<FuzzPacket>| {
    let counters = Arc::new(RingCounters::new());
    let mut reassembler = Reassembler::new(
        ReassemblyConfig {
            max_slots: 4,
            timeout: Duration::from_millis(100),
            emit_partial_on_timeout: true,
        },
        counters,
    );

    let start = Instant::now();
    for (i, p) in packets.iter().enumerate() {
        let depth = if p.sixteen_bit { BitDepth::Sixteen } else { BitDepth::Fourteen };
        let flags =
            if p.last { PacketFlags::empty().with_last_packet() } else { PacketFlags::empty() };
        let header = PacketHeader::new(
            p.frame_seq,
            0,
            p.width,
            p.height,
            depth,
            p.packet_index,
            p.total_packets,
            flags,
        );

        let payload = vec![0u8; usize::from(p.payload_len) % 8193];
        let Ok(packet) = FramePacket::new(header, payload) else { continue };

        let now = start + Duration::from_millis(i as u64);
        let _ = reassembler.process(&packet, now);
        if i % 16 == 0 {
            let _ = reassembler.sweep_expired(now);
        }
    }
});
