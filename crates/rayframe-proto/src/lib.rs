//! Wire protocol for the rayframe detector link.
//!
//! Two independent wire formats share this crate:
//!
//! - **Frame packets** ([`PacketHeader`], [`FramePacket`]): fragments of a
//!   16-bit detector image carried over the data endpoint. Fixed 32-byte raw
//!   binary header (little-endian, CRC-16/CCITT protected) so the receive path
//!   can filter garbage datagrams without touching the payload.
//! - **Command frames** ([`CommandHeader`], [`CommandFrame`],
//!   [`ResponseFrame`]): the authenticated control channel. Fixed 44-byte
//!   header carrying an HMAC-SHA256 tag over the header prefix and payload,
//!   with CBOR-encoded bodies ([`payloads`]).
//!
//! Headers are raw binary for O(1) validation at the socket; payloads that
//! humans configure (scan modes, configuration keys) are self-describing CBOR.
//! Decoding never panics on malformed input — every reject path is a typed
//! [`ProtocolError`].

#![forbid(unsafe_code)]

mod command;
mod errors;
mod header;
mod packet;
pub mod payloads;

pub use command::{
    COMMAND_MAGIC, CommandFrame, CommandHeader, CommandId, HmacKey, RESPONSE_MAGIC, ResponseFrame,
    ResponseStatus, decode_command, decode_response, encode_command, encode_response,
};
pub use errors::{ProtocolError, Result};
pub use header::{BitDepth, PacketFlags, PacketHeader};
pub use packet::FramePacket;

/// Maximum pixel payload carried by a single frame packet, in bytes.
///
/// Sized so header + payload + UDP/IP overhead fits a 9000-byte jumbo frame
/// with room to spare.
pub const MAX_PAYLOAD: usize = 8192;
