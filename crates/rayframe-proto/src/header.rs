//! Frame-packet header with zero-copy parsing.
//!
//! The [`PacketHeader`] is a fixed 32-byte structure serialized as raw binary
//! (little-endian, matching the detector FPGA byte order regardless of host
//! endianness). Geometry is repeated in every packet so a receiver can open a
//! reassembly slot even when the first packet of a frame is lost.
//!
//! Bytes 0..28 are covered by a CRC-16/CCITT stored at offset 28; the final
//! two bytes are reserved (zero on encode, ignored on decode).

use crc::{CRC_16_IBM_3740, Crc};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::errors::{ProtocolError, Result};

/// CRC-16/CCITT as the detector implements it: poly 0x1021, init 0xFFFF,
/// no reflection, no final xor.
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Per-packet flag bits (header `flags` field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFlags(u16);

impl PacketFlags {
    /// Bit 0: this packet is the last of its frame.
    pub const LAST_PACKET: u16 = 1 << 0;
    /// Bit 1: the producer flagged this frame as degraded (e.g. a ring drop
    /// occurred while it was captured).
    pub const ERROR_FRAME: u16 = 1 << 1;

    /// Flags with no bits set.
    #[must_use]
    pub fn empty() -> Self {
        Self(0)
    }

    /// Reconstruct from the raw wire value. Unknown bits are preserved.
    #[must_use]
    pub fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// Raw wire value.
    #[must_use]
    pub fn bits(self) -> u16 {
        self.0
    }

    /// Whether the last-packet bit is set.
    #[must_use]
    pub fn last_packet(self) -> bool {
        self.0 & Self::LAST_PACKET != 0
    }

    /// Whether the error-frame bit is set.
    #[must_use]
    pub fn error_frame(self) -> bool {
        self.0 & Self::ERROR_FRAME != 0
    }

    /// Copy with the last-packet bit set.
    #[must_use]
    pub fn with_last_packet(self) -> Self {
        Self(self.0 | Self::LAST_PACKET)
    }

    /// Copy with the error-frame bit set.
    #[must_use]
    pub fn with_error_frame(self) -> Self {
        Self(self.0 | Self::ERROR_FRAME)
    }
}

/// Pixel depth supported by the detector front-end.
///
/// 14-bit frames are carried in 16-bit words with the upper two bits zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitDepth {
    /// 14 significant bits per pixel
    Fourteen,
    /// Full 16 bits per pixel
    Sixteen,
}

impl BitDepth {
    /// Wire value (the literal bit count).
    #[must_use]
    pub fn to_u16(self) -> u16 {
        match self {
            Self::Fourteen => 14,
            Self::Sixteen => 16,
        }
    }

    /// Parse the wire value. `None` for any depth the detector cannot emit.
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            14 => Some(Self::Fourteen),
            16 => Some(Self::Sixteen),
            _ => None,
        }
    }
}

/// Fixed 32-byte frame-packet header (little-endian).
///
/// Fields are stored as raw byte arrays to avoid alignment requirements, so
/// the struct can be cast by reference from any untrusted datagram buffer.
/// All 32-byte patterns are valid for the cast itself; magic and CRC checks
/// happen in [`PacketHeader::from_bytes`] before a reference escapes.
///
/// # Invariants
///
/// - `packet_index < total_packets` for every packet the sender emits (the
///   reassembler re-checks on receive).
/// - Every packet of one frame carries identical `frame_seq`, geometry and
///   `total_packets`.
/// - `crc16` equals the CRC-16/CCITT of bytes 0..28.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct PacketHeader {
    // Identification (bytes 0-7)
    magic: [u8; 4],     // 0xD7E01234
    frame_seq: [u8; 4], // monotonic frame index

    // Capture time (bytes 8-15)
    timestamp_us: [u8; 8], // producer microsecond clock

    // Geometry, repeated per packet (bytes 16-21)
    width: [u8; 2],
    height: [u8; 2],
    bit_depth: [u8; 2],

    // Fragmentation (bytes 22-27)
    packet_index: [u8; 2],
    total_packets: [u8; 2],
    flags: [u8; 2],

    // Integrity + padding (bytes 28-31)
    crc16: [u8; 2],
    reserved: [u8; 2],
}

impl PacketHeader {
    /// Size of the serialized header.
    pub const SIZE: usize = 32;

    /// Magic number on the frame-data direction.
    pub const MAGIC: u32 = 0xD7E0_1234;

    /// Byte span covered by the CRC.
    const CRC_SPAN: usize = 28;

    /// Build a sealed header: all fields set, CRC computed and stored.
    #[allow(clippy::too_many_arguments)] // wire fields map 1:1 to parameters
    #[must_use]
    pub fn new(
        frame_seq: u32,
        timestamp_us: u64,
        width: u16,
        height: u16,
        bit_depth: BitDepth,
        packet_index: u16,
        total_packets: u16,
        flags: PacketFlags,
    ) -> Self {
        let mut header = Self {
            magic: Self::MAGIC.to_le_bytes(),
            frame_seq: frame_seq.to_le_bytes(),
            timestamp_us: timestamp_us.to_le_bytes(),
            width: width.to_le_bytes(),
            height: height.to_le_bytes(),
            bit_depth: bit_depth.to_u16().to_le_bytes(),
            packet_index: packet_index.to_le_bytes(),
            total_packets: total_packets.to_le_bytes(),
            flags: flags.bits().to_le_bytes(),
            crc16: [0; 2],
            reserved: [0; 2],
        };
        header.seal();
        header
    }

    /// Recompute and store the CRC. Must be called after any field mutation.
    fn seal(&mut self) {
        let bytes = self.to_bytes();
        self.crc16 = CRC16.checksum(&bytes[..Self::CRC_SPAN]).to_le_bytes();
    }

    /// Parse a header from untrusted bytes (zero-copy).
    ///
    /// Validation order is cheapest-first: length, magic, CRC. A reference is
    /// only returned once all three pass; failure has no side effects.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::BadLength`] if fewer than 32 bytes are available
    /// - [`ProtocolError::BadMagic`] if the magic constant mismatches
    /// - [`ProtocolError::BadCrc`] if the stored CRC disagrees with bytes 0..28
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        let header = Self::ref_from_prefix(bytes)
            .map_err(|_| ProtocolError::BadLength { need: Self::SIZE, got: bytes.len() })?
            .0;

        if u32::from_le_bytes(header.magic) != Self::MAGIC {
            return Err(ProtocolError::BadMagic {
                got: u32::from_le_bytes(header.magic),
                expected: Self::MAGIC,
            });
        }

        let computed = CRC16.checksum(&bytes[..Self::CRC_SPAN]);
        let stored = u16::from_le_bytes(header.crc16);
        if computed != stored {
            return Err(ProtocolError::BadCrc { computed, stored });
        }

        Ok(header)
    }

    /// Serialize to the 32-byte wire form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let bytes = IntoBytes::as_bytes(self);
        let mut arr = [0u8; Self::SIZE];
        arr.copy_from_slice(bytes);
        arr
    }

    /// Magic constant as received.
    #[must_use]
    pub fn magic(&self) -> u32 {
        u32::from_le_bytes(self.magic)
    }

    /// Monotonic frame index assigned by the producer.
    #[must_use]
    pub fn frame_seq(&self) -> u32 {
        u32::from_le_bytes(self.frame_seq)
    }

    /// Producer-side capture timestamp, microseconds.
    #[must_use]
    pub fn timestamp_us(&self) -> u64 {
        u64::from_le_bytes(self.timestamp_us)
    }

    /// Frame width in pixels.
    #[must_use]
    pub fn width(&self) -> u16 {
        u16::from_le_bytes(self.width)
    }

    /// Frame height in pixels.
    #[must_use]
    pub fn height(&self) -> u16 {
        u16::from_le_bytes(self.height)
    }

    /// Raw bit-depth field.
    #[must_use]
    pub fn bit_depth_raw(&self) -> u16 {
        u16::from_le_bytes(self.bit_depth)
    }

    /// Bit depth as enum. `None` if the wire value is not 14 or 16.
    #[must_use]
    pub fn bit_depth(&self) -> Option<BitDepth> {
        BitDepth::from_u16(self.bit_depth_raw())
    }

    /// 0-based packet index within the frame.
    #[must_use]
    pub fn packet_index(&self) -> u16 {
        u16::from_le_bytes(self.packet_index)
    }

    /// Total packet count for the frame.
    #[must_use]
    pub fn total_packets(&self) -> u16 {
        u16::from_le_bytes(self.total_packets)
    }

    /// Flag bits.
    #[must_use]
    pub fn flags(&self) -> PacketFlags {
        PacketFlags::from_bits(u16::from_le_bytes(self.flags))
    }

    /// Stored CRC value.
    #[must_use]
    pub fn crc16(&self) -> u16 {
        u16::from_le_bytes(self.crc16)
    }

    /// Update the flag bits and re-seal the CRC.
    pub fn set_flags(&mut self, flags: PacketFlags) {
        self.flags = flags.bits().to_le_bytes();
        self.seal();
    }

    /// Update the packet index and re-seal the CRC.
    pub fn set_packet_index(&mut self, packet_index: u16) {
        self.packet_index = packet_index.to_le_bytes();
        self.seal();
    }
}

// Manual Debug implementation (can't derive due to packed repr)
impl std::fmt::Debug for PacketHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketHeader")
            .field("magic", &format_args!("{:#010x}", self.magic()))
            .field("frame_seq", &self.frame_seq())
            .field("timestamp_us", &self.timestamp_us())
            .field("width", &self.width())
            .field("height", &self.height())
            .field("bit_depth", &self.bit_depth_raw())
            .field("packet_index", &self.packet_index())
            .field("total_packets", &self.total_packets())
            .field("flags", &self.flags())
            .field("crc16", &format_args!("{:#06x}", self.crc16()))
            .finish()
    }
}

// Manual PartialEq implementation (can't derive due to packed repr)
impl PartialEq for PacketHeader {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for PacketHeader {}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    impl Arbitrary for PacketHeader {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with((): Self::Parameters) -> Self::Strategy {
            (
                any::<u32>(),                         // frame_seq
                any::<u64>(),                         // timestamp_us
                128u16..=4096,                        // width
                128u16..=4096,                        // height
                prop_oneof![Just(BitDepth::Fourteen), Just(BitDepth::Sixteen)],
                (0u16..4096, 1u16..=4096),            // (index, total) pair, fixed below
                prop::bool::ANY,                      // last_packet
                prop::bool::ANY,                      // error_frame
            )
                .prop_map(|(seq, ts, w, h, depth, (index, total), last, error)| {
                    let index = index % total;
                    let mut flags = PacketFlags::empty();
                    if last {
                        flags = flags.with_last_packet();
                    }
                    if error {
                        flags = flags.with_error_frame();
                    }
                    Self::new(seq, ts, w, h, depth, index, total, flags)
                })
                .boxed()
        }
    }

    #[test]
    fn header_size() {
        assert_eq!(std::mem::size_of::<PacketHeader>(), PacketHeader::SIZE);
        assert_eq!(PacketHeader::SIZE, 32);
    }

    #[test]
    fn crc_matches_known_vector() {
        // CRC-16/CCITT-FALSE check value: crc("123456789") == 0x29B1
        assert_eq!(CRC16.checksum(b"123456789"), 0x29B1);
    }

    proptest! {
        #[test]
        fn header_round_trip(header in any::<PacketHeader>()) {
            let bytes = header.to_bytes();
            let parsed = PacketHeader::from_bytes(&bytes).expect("should parse");
            prop_assert_eq!(&header, parsed);
        }

        #[test]
        fn corrupting_any_covered_byte_fails_crc(
            header in any::<PacketHeader>(),
            offset in 0usize..28,
            xor in 1u8..=255,
        ) {
            let mut bytes = header.to_bytes();
            bytes[offset] ^= xor;
            let result = PacketHeader::from_bytes(&bytes);
            // Corrupting the magic reports BadMagic, anything else BadCrc;
            // either way the packet never parses.
            prop_assert!(result.is_err());
        }
    }

    #[test]
    fn reject_short_buffer() {
        let short = [0u8; 20];
        assert_eq!(
            PacketHeader::from_bytes(&short),
            Err(ProtocolError::BadLength { need: 32, got: 20 })
        );
    }

    #[test]
    fn reject_bad_magic() {
        let mut bytes =
            PacketHeader::new(0, 0, 128, 128, BitDepth::Sixteen, 0, 1, PacketFlags::empty())
                .to_bytes();
        bytes[0..4].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        assert!(matches!(
            PacketHeader::from_bytes(&bytes),
            Err(ProtocolError::BadMagic { got: 0xFFFF_FFFF, .. })
        ));
    }

    #[test]
    fn reject_flipped_crc() {
        let mut bytes =
            PacketHeader::new(7, 1, 256, 256, BitDepth::Fourteen, 0, 4, PacketFlags::empty())
                .to_bytes();
        bytes[28] ^= 0x01;
        assert!(matches!(PacketHeader::from_bytes(&bytes), Err(ProtocolError::BadCrc { .. })));
    }

    #[test]
    fn set_flags_reseals() {
        let mut header =
            PacketHeader::new(1, 2, 512, 512, BitDepth::Sixteen, 3, 8, PacketFlags::empty());
        header.set_flags(PacketFlags::empty().with_error_frame());

        let bytes = header.to_bytes();
        let parsed = PacketHeader::from_bytes(&bytes).expect("re-sealed header parses");
        assert!(parsed.flags().error_frame());
    }

    #[test]
    fn last_packet_flag_round_trips() {
        let header = PacketHeader::new(
            9,
            10,
            1024,
            1024,
            BitDepth::Sixteen,
            255,
            256,
            PacketFlags::empty().with_last_packet(),
        );
        let bytes = header.to_bytes();
        let parsed = PacketHeader::from_bytes(&bytes).expect("should parse");
        assert!(parsed.flags().last_packet());
        assert!(!parsed.flags().error_frame());
    }
}
