//! Frame packet: header plus payload slice.
//!
//! A [`FramePacket`] is one datagram on the data endpoint: the 32-byte
//! [`PacketHeader`] followed by up to [`MAX_PAYLOAD`](crate::MAX_PAYLOAD)
//! bytes of little-endian pixel data. This is a pure data holder; reassembly
//! and ordering logic live in `rayframe-core`.

use bytes::{BufMut, Bytes};

use crate::{
    MAX_PAYLOAD, PacketHeader,
    errors::{ProtocolError, Result},
};

/// One fragment of a frame as carried on the wire.
///
/// # Invariants
///
/// - `payload.len() <= MAX_PAYLOAD`, enforced by [`FramePacket::new`] and
///   re-checked by [`FramePacket::decode`].
/// - The header is sealed (valid CRC); [`FramePacket::decode`] only returns
///   packets whose header verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePacket {
    /// Sealed packet header
    pub header: PacketHeader,

    /// Pixel payload bytes (little-endian u16 samples)
    pub payload: Bytes,
}

impl FramePacket {
    /// Create a packet from a sealed header and payload.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::PayloadTooLarge`] if the payload exceeds
    ///   [`MAX_PAYLOAD`](crate::MAX_PAYLOAD)
    pub fn new(header: PacketHeader, payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge { size: payload.len(), max: MAX_PAYLOAD });
        }
        Ok(Self { header, payload })
    }

    /// Total wire size of this packet.
    #[must_use]
    pub fn wire_len(&self) -> usize {
        PacketHeader::SIZE + self.payload.len()
    }

    /// Encode into a buffer: `[header (32 bytes)] + [payload]`.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_slice(&self.header.to_bytes());
        dst.put_slice(&self.payload);
    }

    /// Decode a packet from one received datagram.
    ///
    /// The entire remainder after the header is the payload; datagram framing
    /// already bounds it, so there is no length field to cross-check.
    ///
    /// # Errors
    ///
    /// - Any [`PacketHeader::from_bytes`] error (length, magic, CRC)
    /// - [`ProtocolError::PayloadTooLarge`] if the datagram carries more than
    ///   [`MAX_PAYLOAD`](crate::MAX_PAYLOAD) payload bytes
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = *PacketHeader::from_bytes(bytes)?;

        let payload_len = bytes.len() - PacketHeader::SIZE;
        if payload_len > MAX_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge { size: payload_len, max: MAX_PAYLOAD });
        }

        let payload = Bytes::copy_from_slice(&bytes[PacketHeader::SIZE..]);
        Ok(Self { header, payload })
    }
}
