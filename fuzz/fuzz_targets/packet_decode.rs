//! Fuzz target for FramePacket::decode
//!
//! Arbitrary bytes must never panic the packet decoder: parser crashes,
//! integer overflows in size math and buffer over-reads all surface here.
//! Invalid input must only ever produce an error.

#![no_main]

use libfuzzer_sys::fuzz_target;
use rayframe_proto::FramePacket;

fuzz_target!(|data: &[u8]| {
    // This should never panic, only return Err for invalid data
    let _ = FramePacket::decode(data);
});
