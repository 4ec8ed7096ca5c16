//! Authenticated command/response framing for the control channel.
//!
//! Commands and responses share one 44-byte header layout: magic, sequence,
//! a 16-bit id slot (command id on requests, status code on responses), the
//! payload length, and an HMAC-SHA256 tag over the 12-byte header prefix
//! concatenated with the payload. Only the magic distinguishes direction.
//!
//! The tag covers everything an attacker could usefully flip — sequence,
//! id, payload — so replay protection reduces to the receiver's monotonic
//! sequence check. Verification goes through [`hmac::Mac::verify_slice`],
//! which compares in constant time.

use bytes::{BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::errors::{ProtocolError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Magic on the command (host → detector) direction.
pub const COMMAND_MAGIC: u32 = 0xBEEF_CAFE;

/// Magic on the response (detector → host) direction.
pub const RESPONSE_MAGIC: u32 = 0xCAFE_BEEF;

/// Pre-shared symmetric key for control-channel authentication.
///
/// Loaded once at startup and immutable afterwards. The `Debug` impl never
/// prints key material.
#[derive(Clone)]
pub struct HmacKey(Vec<u8>);

impl HmacKey {
    /// Wrap raw key bytes.
    #[must_use]
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Fresh MAC instance keyed with this key.
    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length, so construction cannot fail.
        HmacSha256::new_from_slice(&self.0)
            .ok()
            .unwrap_or_else(|| unreachable!("hmac accepts any key length"))
    }
}

impl std::fmt::Debug for HmacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("HmacKey").field(&"<redacted>").finish()
    }
}

/// Control-channel operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandId {
    /// Begin a scan (payload: [`payloads::StartScan`](crate::payloads::StartScan))
    StartScan,
    /// Stop the active scan
    StopScan,
    /// Query cached status and counters
    GetStatus,
    /// Apply one configuration key (payload: [`payloads::SetConfig`](crate::payloads::SetConfig))
    SetConfig,
    /// Return to idle and reinitialize
    Reset,
}

impl CommandId {
    /// Wire value.
    #[must_use]
    pub fn to_u16(self) -> u16 {
        match self {
            Self::StartScan => 0x0001,
            Self::StopScan => 0x0002,
            Self::GetStatus => 0x0003,
            Self::SetConfig => 0x0004,
            Self::Reset => 0x0005,
        }
    }

    /// Parse the wire value. `None` for ids this build does not know.
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0001 => Some(Self::StartScan),
            0x0002 => Some(Self::StopScan),
            0x0003 => Some(Self::GetStatus),
            0x0004 => Some(Self::SetConfig),
            0x0005 => Some(Self::Reset),
            _ => None,
        }
    }
}

/// Response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    /// Command accepted and executed
    Ok,
    /// Command failed (payload carries a diagnostic)
    Error,
    /// Command rejected because the detector is not idle
    Busy,
}

impl ResponseStatus {
    /// Wire value.
    #[must_use]
    pub fn to_u16(self) -> u16 {
        match self {
            Self::Ok => 0x0000,
            Self::Error => 0x0001,
            Self::Busy => 0x0002,
        }
    }

    /// Parse the wire value.
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0000 => Some(Self::Ok),
            0x0001 => Some(Self::Error),
            0x0002 => Some(Self::Busy),
            _ => None,
        }
    }
}

/// Fixed 44-byte control-channel header (little-endian).
///
/// The `id` slot carries the command id on requests and the status code on
/// responses. Bytes 0..12 plus the payload are covered by the HMAC tag
/// stored at bytes 12..44.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct CommandHeader {
    magic: [u8; 4],
    sequence: [u8; 4],
    id: [u8; 2],
    payload_len: [u8; 2],
    hmac: [u8; 32],
}

impl CommandHeader {
    /// Size of the serialized header.
    pub const SIZE: usize = 44;

    /// Prefix covered by the HMAC (everything before the tag).
    const AUTH_SPAN: usize = 12;

    /// Sequence number.
    #[must_use]
    pub fn sequence(&self) -> u32 {
        u32::from_le_bytes(self.sequence)
    }

    /// Raw id slot (command id or status code).
    #[must_use]
    pub fn id(&self) -> u16 {
        u16::from_le_bytes(self.id)
    }

    /// Claimed payload length.
    #[must_use]
    pub fn payload_len(&self) -> u16 {
        u16::from_le_bytes(self.payload_len)
    }
}

impl std::fmt::Debug for CommandHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandHeader")
            .field("magic", &format_args!("{:#010x}", u32::from_le_bytes(self.magic)))
            .field("sequence", &self.sequence())
            .field("id", &format_args!("{:#06x}", self.id()))
            .field("payload_len", &self.payload_len())
            .finish_non_exhaustive()
    }
}

/// A verified command as decoded from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    /// Sender-assigned monotonic sequence number
    pub sequence: u32,
    /// Raw command id (may be unknown to this build)
    pub command_id: u16,
    /// CBOR payload bytes
    pub payload: Bytes,
}

impl CommandFrame {
    /// Command id as enum. `None` for unknown ids — the control plane
    /// answers those with an ERROR response rather than dropping them.
    #[must_use]
    pub fn command(&self) -> Option<CommandId> {
        CommandId::from_u16(self.command_id)
    }
}

/// A verified response as decoded from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    /// Echo of the command sequence number
    pub sequence: u32,
    /// Raw status code
    pub status_raw: u16,
    /// CBOR payload bytes
    pub payload: Bytes,
}

impl ResponseFrame {
    /// Status as enum. `None` for codes this build does not know.
    #[must_use]
    pub fn status(&self) -> Option<ResponseStatus> {
        ResponseStatus::from_u16(self.status_raw)
    }
}

/// Encode an authenticated command frame.
///
/// # Errors
///
/// - [`ProtocolError::PayloadTooLarge`] if the payload exceeds the u16
///   length field
pub fn encode_command(
    sequence: u32,
    command: CommandId,
    payload: &[u8],
    key: &HmacKey,
) -> Result<Bytes> {
    encode_authenticated(COMMAND_MAGIC, sequence, command.to_u16(), payload, key)
}

/// Encode an authenticated response frame.
///
/// # Errors
///
/// - [`ProtocolError::PayloadTooLarge`] if the payload exceeds the u16
///   length field
pub fn encode_response(
    sequence: u32,
    status: ResponseStatus,
    payload: &[u8],
    key: &HmacKey,
) -> Result<Bytes> {
    encode_authenticated(RESPONSE_MAGIC, sequence, status.to_u16(), payload, key)
}

/// Decode and verify a command frame.
///
/// # Errors
///
/// - [`ProtocolError::Truncated`] if the buffer is shorter than the header
///   or the claimed payload
/// - [`ProtocolError::BadMagic`] if the magic is not [`COMMAND_MAGIC`]
/// - [`ProtocolError::BadHmac`] if the tag does not verify
pub fn decode_command(bytes: &[u8], key: &HmacKey) -> Result<CommandFrame> {
    let (sequence, id, payload) = decode_authenticated(bytes, COMMAND_MAGIC, key)?;
    Ok(CommandFrame { sequence, command_id: id, payload })
}

/// Decode and verify a response frame.
///
/// # Errors
///
/// Same as [`decode_command`], expecting [`RESPONSE_MAGIC`].
pub fn decode_response(bytes: &[u8], key: &HmacKey) -> Result<ResponseFrame> {
    let (sequence, id, payload) = decode_authenticated(bytes, RESPONSE_MAGIC, key)?;
    Ok(ResponseFrame { sequence, status_raw: id, payload })
}

fn encode_authenticated(
    magic: u32,
    sequence: u32,
    id: u16,
    payload: &[u8],
    key: &HmacKey,
) -> Result<Bytes> {
    let payload_len = u16::try_from(payload.len())
        .map_err(|_| ProtocolError::PayloadTooLarge { size: payload.len(), max: u16::MAX as usize })?;

    let mut prefix = [0u8; CommandHeader::AUTH_SPAN];
    prefix[0..4].copy_from_slice(&magic.to_le_bytes());
    prefix[4..8].copy_from_slice(&sequence.to_le_bytes());
    prefix[8..10].copy_from_slice(&id.to_le_bytes());
    prefix[10..12].copy_from_slice(&payload_len.to_le_bytes());

    let mut mac = key.mac();
    mac.update(&prefix);
    mac.update(payload);
    let tag = mac.finalize().into_bytes();

    let mut wire = BytesMut::with_capacity(CommandHeader::SIZE + payload.len());
    wire.put_slice(&prefix);
    wire.put_slice(&tag);
    wire.put_slice(payload);
    Ok(wire.freeze())
}

fn decode_authenticated(bytes: &[u8], magic: u32, key: &HmacKey) -> Result<(u32, u16, Bytes)> {
    let header = CommandHeader::ref_from_prefix(bytes)
        .map_err(|_| ProtocolError::Truncated { claimed: CommandHeader::SIZE, got: bytes.len() })?
        .0;

    if u32::from_le_bytes(header.magic) != magic {
        return Err(ProtocolError::BadMagic {
            got: u32::from_le_bytes(header.magic),
            expected: magic,
        });
    }

    let payload_len = header.payload_len() as usize;
    let available = bytes.len() - CommandHeader::SIZE;
    if available < payload_len {
        return Err(ProtocolError::Truncated { claimed: payload_len, got: available });
    }

    // Exactly payload_len bytes; datagram trailing bytes are ignored and
    // never authenticated.
    let payload = &bytes[CommandHeader::SIZE..CommandHeader::SIZE + payload_len];

    let mut mac = key.mac();
    mac.update(&bytes[..CommandHeader::AUTH_SPAN]);
    mac.update(payload);
    mac.verify_slice(&header.hmac).map_err(|_| ProtocolError::BadHmac)?;

    Ok((header.sequence(), header.id(), Bytes::copy_from_slice(payload)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> HmacKey {
        // 32 bytes, as provisioned through DETECTOR_HMAC_KEY.
        HmacKey::new(
            hex::decode("3031323334353637383961626364656630313233343536373839616263646566")
                .expect("valid hex"),
        )
    }

    #[test]
    fn command_header_size() {
        assert_eq!(std::mem::size_of::<CommandHeader>(), CommandHeader::SIZE);
        assert_eq!(CommandHeader::SIZE, 44);
    }

    #[test]
    fn command_round_trip() {
        let wire =
            encode_command(7, CommandId::StartScan, b"mode-bytes", &key()).expect("encodes");
        let cmd = decode_command(&wire, &key()).expect("verifies");

        assert_eq!(cmd.sequence, 7);
        assert_eq!(cmd.command(), Some(CommandId::StartScan));
        assert_eq!(&cmd.payload[..], b"mode-bytes");
    }

    #[test]
    fn response_round_trip() {
        let wire = encode_response(7, ResponseStatus::Busy, b"", &key()).expect("encodes");
        let resp = decode_response(&wire, &key()).expect("verifies");

        assert_eq!(resp.sequence, 7);
        assert_eq!(resp.status(), Some(ResponseStatus::Busy));
        assert!(resp.payload.is_empty());
    }

    #[test]
    fn command_and_response_magics_do_not_cross() {
        let wire = encode_command(1, CommandId::GetStatus, b"", &key()).expect("encodes");
        assert!(matches!(decode_response(&wire, &key()), Err(ProtocolError::BadMagic { .. })));
    }

    #[test]
    fn wrong_key_fails_verification() {
        let wire = encode_command(1, CommandId::StopScan, b"", &key()).expect("encodes");
        let other = HmacKey::new(*b"ffffffffffffffffffffffffffffffff");
        assert_eq!(decode_command(&wire, &other), Err(ProtocolError::BadHmac));
    }

    #[test]
    fn tampered_sequence_fails_verification() {
        let wire = encode_command(1, CommandId::StopScan, b"", &key()).expect("encodes");
        let mut tampered = wire.to_vec();
        tampered[4] ^= 0x01; // sequence low byte
        assert_eq!(decode_command(&tampered, &key()), Err(ProtocolError::BadHmac));
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let wire = encode_command(1, CommandId::SetConfig, b"fps=30", &key()).expect("encodes");
        let mut tampered = wire.to_vec();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x80;
        assert_eq!(decode_command(&tampered, &key()), Err(ProtocolError::BadHmac));
    }

    #[test]
    fn every_tag_byte_is_checked() {
        let wire = encode_command(9, CommandId::Reset, b"", &key()).expect("encodes");
        for offset in 12..44 {
            let mut tampered = wire.to_vec();
            tampered[offset] ^= 0xFF;
            assert_eq!(
                decode_command(&tampered, &key()),
                Err(ProtocolError::BadHmac),
                "tag byte {offset} not verified"
            );
        }
    }

    #[test]
    fn truncated_frames_rejected() {
        let wire = encode_command(1, CommandId::GetStatus, b"abc", &key()).expect("encodes");

        // Shorter than the header
        assert!(matches!(
            decode_command(&wire[..20], &key()),
            Err(ProtocolError::Truncated { .. })
        ));

        // Header intact, payload cut short
        assert!(matches!(
            decode_command(&wire[..CommandHeader::SIZE + 1], &key()),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn unknown_command_id_still_verifies() {
        let wire = encode_authenticated(COMMAND_MAGIC, 3, 0x00FF, b"", &key()).expect("encodes");
        let cmd = decode_command(&wire, &key()).expect("verifies");
        assert_eq!(cmd.command_id, 0x00FF);
        assert_eq!(cmd.command(), None);
    }

    #[test]
    fn trailing_datagram_bytes_are_ignored() {
        let wire = encode_command(2, CommandId::GetStatus, b"xy", &key()).expect("encodes");
        let mut padded = wire.to_vec();
        padded.extend_from_slice(b"junk");

        let cmd = decode_command(&padded, &key()).expect("verifies");
        assert_eq!(&cmd.payload[..], b"xy");
    }
}
