//! Protocol error types.
//!
//! Every malformed input maps to a specific variant so callers can count and
//! log rejects by kind. Decoding is side-effect free: an error means the
//! input was discarded, nothing more.

use thiserror::Error;

/// Convenience alias for protocol results.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while encoding or decoding wire records.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Magic number did not match the expected constant
    #[error("bad magic: got {got:#010x}, expected {expected:#010x}")]
    BadMagic {
        /// Value found on the wire
        got: u32,
        /// Constant this decoder expects
        expected: u32,
    },

    /// Buffer shorter than the fixed header
    #[error("bad length: need {need} bytes, got {got}")]
    BadLength {
        /// Minimum byte count required
        need: usize,
        /// Bytes actually available
        got: usize,
    },

    /// Header CRC-16 mismatch
    #[error("bad crc: computed {computed:#06x}, stored {stored:#06x}")]
    BadCrc {
        /// CRC computed over the received header
        computed: u16,
        /// CRC carried in the header
        stored: u16,
    },

    /// HMAC-SHA256 tag did not verify
    #[error("bad hmac tag")]
    BadHmac,

    /// Datagram ended before the length its framing requires
    #[error("truncated: expected {claimed} bytes, got {got}")]
    Truncated {
        /// Byte count the framing requires
        claimed: usize,
        /// Bytes actually present
        got: usize,
    },

    /// Payload exceeds the per-packet maximum
    #[error("payload too large: {size} bytes exceeds {max}")]
    PayloadTooLarge {
        /// Offending payload size
        size: usize,
        /// Allowed maximum
        max: usize,
    },

    /// CBOR body failed to encode or decode
    #[error("payload codec error: {0}")]
    PayloadCodec(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_render_offsets_in_hex() {
        let err = ProtocolError::BadMagic { got: 0xDEAD_BEEF, expected: 0xD7E0_1234 };
        assert!(err.to_string().contains("0xdeadbeef"));

        let err = ProtocolError::BadCrc { computed: 0x1234, stored: 0x4321 };
        assert!(err.to_string().contains("0x1234"));
    }
}
