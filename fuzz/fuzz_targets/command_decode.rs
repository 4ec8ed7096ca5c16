//! Fuzz target for decode_command / decode_response
//!
//! Arbitrary bytes against both control-channel decoders, plus the CBOR body
//! decoders behind them. Nothing here may panic; unauthenticated garbage must
//! die with a typed error before any body parsing happens.

#![no_main]

use libfuzzer_sys::fuzz_target;
use rayframe_proto::{
    HmacKey, decode_command, decode_response,
    payloads::{SetConfig, StartScan, StatusBody, decode_body},
};

fuzz_target!(|data: &[u8]| {
    let key = HmacKey::new(*b"fuzzing-preshared-key-32-bytes!!");

    let _ = decode_command(data, &key);
    let _ = decode_response(data, &key);

    // Body decoders see attacker bytes only after HMAC passes, but they must
    // still be panic-free on their own.
    let _ = decode_body::<StartScan>(data);
    let _ = decode_body::<SetConfig>(data);
    let _ = decode_body::<StatusBody>(data);
});
