//! Frame output: RAW with a JSON sidecar, and minimal grayscale TIFF.
//!
//! RAW is the archival format — pixel bytes exactly as they came off the
//! wire, with a machine-readable manifest next to them. TIFF is the
//! interchange format: single-strip, uncompressed, 16-bit grayscale,
//! little-endian, readable by any imaging tool. DICOM is handled by the
//! external encoder and is deliberately absent here.

use std::io::Write;
use std::path::Path;

use rayframe_core::Frame;
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// Supported output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// Raw little-endian pixel bytes plus a `<path>.json` sidecar
    Raw,
    /// Single-strip uncompressed grayscale TIFF
    Tiff,
}

/// Sidecar manifest written next to RAW output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidecarManifest {
    /// Frame width in pixels
    pub width: u16,
    /// Frame height in pixels
    pub height: u16,
    /// Significant bits per pixel
    pub bit_depth: u16,
    /// Producer frame sequence
    pub frame_seq: u32,
    /// Capture timestamp, microseconds
    pub timestamp_us: u64,
    /// Sample encoding tag
    pub pixel_format: String,
    /// Frame arrived incomplete or flagged degraded
    pub degraded: bool,
}

/// Write a frame to `path` in the requested format.
pub fn save_frame(frame: &Frame, path: impl AsRef<Path>, format: ImageFormat) -> Result<(), ClientError> {
    match format {
        ImageFormat::Raw => save_raw(frame, path.as_ref()),
        ImageFormat::Tiff => save_tiff(frame, path.as_ref()),
    }
}

fn save_raw(frame: &Frame, path: &Path) -> Result<(), ClientError> {
    std::fs::write(path, frame.to_le_bytes())
        .map_err(|e| ClientError::Output(format!("writing {}: {e}", path.display())))?;

    let manifest = SidecarManifest {
        width: frame.width,
        height: frame.height,
        bit_depth: frame.bit_depth.to_u16(),
        frame_seq: frame.sequence,
        timestamp_us: frame.timestamp_us,
        pixel_format: "u16le".to_string(),
        degraded: frame.degraded,
    };

    let sidecar_path = sidecar_path(path);
    let json = serde_json::to_vec_pretty(&manifest)
        .map_err(|e| ClientError::Output(format!("encoding sidecar: {e}")))?;
    std::fs::write(&sidecar_path, json)
        .map_err(|e| ClientError::Output(format!("writing {}: {e}", sidecar_path.display())))?;
    Ok(())
}

/// Sidecar lives next to the RAW file with `.json` appended.
pub fn sidecar_path(path: &Path) -> std::path::PathBuf {
    let mut sidecar = path.as_os_str().to_owned();
    sidecar.push(".json");
    std::path::PathBuf::from(sidecar)
}

// TIFF tags used by the writer.
const TAG_IMAGE_WIDTH: u16 = 256;
const TAG_IMAGE_LENGTH: u16 = 257;
const TAG_BITS_PER_SAMPLE: u16 = 258;
const TAG_COMPRESSION: u16 = 259;
const TAG_PHOTOMETRIC: u16 = 262;
const TAG_STRIP_OFFSETS: u16 = 273;
const TAG_ROWS_PER_STRIP: u16 = 278;
const TAG_STRIP_BYTE_COUNTS: u16 = 279;

const TYPE_SHORT: u16 = 3;
const TYPE_LONG: u16 = 4;

/// Minimal little-endian TIFF: one IFD, one strip, no compression.
fn save_tiff(frame: &Frame, path: &Path) -> Result<(), ClientError> {
    let entries: u16 = 8;
    // Header (8) + entry count (2) + entries (12 each) + next-IFD (4).
    let data_offset = 8 + 2 + u32::from(entries) * 12 + 4;
    let pixel_bytes = frame.to_le_bytes();

    let mut out = Vec::with_capacity(data_offset as usize + pixel_bytes.len());

    // Header: byte order "II", magic 42, offset of the first IFD.
    out.extend_from_slice(b"II");
    out.extend_from_slice(&42u16.to_le_bytes());
    out.extend_from_slice(&8u32.to_le_bytes());

    // IFD.
    out.extend_from_slice(&entries.to_le_bytes());
    ifd_entry(&mut out, TAG_IMAGE_WIDTH, TYPE_SHORT, u32::from(frame.width));
    ifd_entry(&mut out, TAG_IMAGE_LENGTH, TYPE_SHORT, u32::from(frame.height));
    ifd_entry(&mut out, TAG_BITS_PER_SAMPLE, TYPE_SHORT, 16);
    ifd_entry(&mut out, TAG_COMPRESSION, TYPE_SHORT, 1); // none
    ifd_entry(&mut out, TAG_PHOTOMETRIC, TYPE_SHORT, 1); // black is zero
    ifd_entry(&mut out, TAG_STRIP_OFFSETS, TYPE_LONG, data_offset);
    ifd_entry(&mut out, TAG_ROWS_PER_STRIP, TYPE_SHORT, u32::from(frame.height));
    ifd_entry(&mut out, TAG_STRIP_BYTE_COUNTS, TYPE_LONG, pixel_bytes.len() as u32);
    out.extend_from_slice(&0u32.to_le_bytes()); // no next IFD

    debug_assert_eq!(out.len(), data_offset as usize);
    out.extend_from_slice(&pixel_bytes);

    let mut file = std::fs::File::create(path)
        .map_err(|e| ClientError::Output(format!("creating {}: {e}", path.display())))?;
    file.write_all(&out)
        .map_err(|e| ClientError::Output(format!("writing {}: {e}", path.display())))?;
    Ok(())
}

/// One 12-byte IFD entry with an inline value.
fn ifd_entry(out: &mut Vec<u8>, tag: u16, field_type: u16, value: u32) {
    out.extend_from_slice(&tag.to_le_bytes());
    out.extend_from_slice(&field_type.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes()); // count
    match field_type {
        // SHORT values sit left-justified in the 4-byte slot.
        TYPE_SHORT => {
            out.extend_from_slice(&(value as u16).to_le_bytes());
            out.extend_from_slice(&[0, 0]);
        },
        _ => out.extend_from_slice(&value.to_le_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use rayframe_proto::BitDepth;

    use super::*;

    fn test_frame() -> Frame {
        let bytes: Vec<u8> =
            (0u32..16 * 8).flat_map(|i| ((i * 17 % 65536) as u16).to_le_bytes()).collect();
        Frame::from_le_bytes(42, 5_000_000, 16, 8, BitDepth::Sixteen, false, &bytes)
    }

    #[test]
    fn raw_output_round_trips_with_sidecar() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("frame_42.raw");
        let frame = test_frame();

        save_frame(&frame, &path, ImageFormat::Raw).expect("saves");

        let bytes = std::fs::read(&path).expect("raw file");
        assert_eq!(bytes, frame.to_le_bytes());

        let sidecar = std::fs::read(sidecar_path(&path)).expect("sidecar file");
        let manifest: SidecarManifest = serde_json::from_slice(&sidecar).expect("parses");
        assert_eq!(manifest.width, 16);
        assert_eq!(manifest.height, 8);
        assert_eq!(manifest.bit_depth, 16);
        assert_eq!(manifest.frame_seq, 42);
        assert_eq!(manifest.timestamp_us, 5_000_000);
        assert_eq!(manifest.pixel_format, "u16le");
        assert!(!manifest.degraded);
    }

    #[test]
    fn tiff_output_is_well_formed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("frame_42.tif");
        let frame = test_frame();

        save_frame(&frame, &path, ImageFormat::Tiff).expect("saves");
        let bytes = std::fs::read(&path).expect("tiff file");

        // Header.
        assert_eq!(&bytes[0..2], b"II");
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), 42);
        let ifd = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        assert_eq!(ifd, 8);

        // Entry count and tag ordering.
        let count = u16::from_le_bytes([bytes[ifd], bytes[ifd + 1]]) as usize;
        assert_eq!(count, 8);
        let mut last_tag = 0u16;
        for i in 0..count {
            let at = ifd + 2 + i * 12;
            let tag = u16::from_le_bytes([bytes[at], bytes[at + 1]]);
            assert!(tag > last_tag, "tags must ascend");
            last_tag = tag;
        }

        // Strip offset points at pixel data identical to the frame bytes.
        let strip_entry = ifd + 2 + 5 * 12; // sixth entry: StripOffsets
        assert_eq!(
            u16::from_le_bytes([bytes[strip_entry], bytes[strip_entry + 1]]),
            TAG_STRIP_OFFSETS
        );
        let offset = u32::from_le_bytes([
            bytes[strip_entry + 8],
            bytes[strip_entry + 9],
            bytes[strip_entry + 10],
            bytes[strip_entry + 11],
        ]) as usize;
        assert_eq!(&bytes[offset..], &frame.to_le_bytes()[..]);
    }

    #[test]
    fn degraded_flag_lands_in_sidecar() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("partial.raw");
        let bytes = vec![0u8; 16 * 8 * 2];
        let frame = Frame::from_le_bytes(7, 0, 16, 8, BitDepth::Fourteen, true, &bytes);

        save_frame(&frame, &path, ImageFormat::Raw).expect("saves");
        let manifest: SidecarManifest =
            serde_json::from_slice(&std::fs::read(sidecar_path(&path)).expect("sidecar"))
                .expect("parses");
        assert!(manifest.degraded);
        assert_eq!(manifest.bit_depth, 14);
    }
}
