//! Assembled frame model.

use rayframe_proto::BitDepth;

/// One complete detector image.
///
/// Immutable after assembly: created by the reassembler (host side) or
/// borrowed from capture (device side), then owned exclusively by one
/// consumer until dropped. Pixels are in scan order, one `u16` per pixel;
/// for 14-bit frames the top two bits are zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Producer-assigned monotonic frame index
    pub sequence: u32,
    /// Capture timestamp, microseconds on the producer clock
    pub timestamp_us: u64,
    /// Width in pixels
    pub width: u16,
    /// Height in pixels
    pub height: u16,
    /// Pixel depth
    pub bit_depth: BitDepth,
    /// Frame arrived incomplete or was flagged degraded by the producer
    pub degraded: bool,
    pixels: Vec<u16>,
}

impl Frame {
    /// Assemble a frame from little-endian pixel bytes.
    ///
    /// `bytes` must be exactly `width * height * 2` long; the reassembler
    /// guarantees this by trimming its slot buffer before calling.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn from_le_bytes(
        sequence: u32,
        timestamp_us: u64,
        width: u16,
        height: u16,
        bit_depth: BitDepth,
        degraded: bool,
        bytes: &[u8],
    ) -> Self {
        debug_assert_eq!(bytes.len(), usize::from(width) * usize::from(height) * 2);

        let pixels = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        Self { sequence, timestamp_us, width, height, bit_depth, degraded, pixels }
    }

    /// Pixel data in scan order.
    #[must_use]
    pub fn pixels(&self) -> &[u16] {
        &self.pixels
    }

    /// Pixel count (`width * height`).
    #[must_use]
    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    /// Whether the frame holds no pixels. Never true for assembled frames.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    /// Pixel data as little-endian bytes (wire/file order).
    #[must_use]
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.pixels.len() * 2);
        for pixel in &self.pixels {
            out.extend_from_slice(&pixel.to_le_bytes());
        }
        out
    }

    /// Map the frame to an 8-bit preview through a window/level transfer.
    ///
    /// `center` and `width` are in pixel-value units. Values at or below
    /// `center - width/2` map to 0, at or above `center + width/2` to 255,
    /// linear in between. `width == 0` degenerates to a threshold at
    /// `center`.
    #[must_use]
    pub fn window_level(&self, center: u16, width: u16) -> Vec<u8> {
        let center = f64::from(center);
        let width = f64::from(width.max(1));
        let low = center - width / 2.0;

        self.pixels
            .iter()
            .map(|&p| {
                let scaled = ((f64::from(p) - low) / width * 255.0).round();
                scaled.clamp(0.0, 255.0) as u8
            })
            .collect()
    }
}
