//! CBOR-encoded control-channel bodies.
//!
//! Command headers are raw binary for cheap filtering, but bodies use CBOR:
//! self-describing, compact, and no code generation. The body type is
//! selected by the header's command id (requests) or by the command being
//! answered (responses) — there is no variant tag on the wire, so a body
//! cannot disagree with its header about what it is.

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::errors::{ProtocolError, Result};

/// Scan acquisition modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// Capture one frame, then stop
    Single,
    /// Capture until STOP_SCAN
    Continuous,
    /// Single-frame capture against the calibration register bank
    Calibration,
}

/// Body of a START_SCAN command.
///
/// Calibration mode carries no extra fields: `tier` selects the calibration
/// bank row, and is ignored for the other modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartScan {
    /// Requested acquisition mode
    pub mode: ScanMode,
    /// Gain/calibration tier
    pub tier: u8,
}

/// Body of a SET_CONFIG command: one key/value pair, validated server-side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetConfig {
    /// Configuration key name
    pub key: String,
    /// New value, parsed according to the key
    pub value: String,
}

/// Scan pipeline phase as reported over the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanPhase {
    /// Waiting for a START_SCAN
    #[default]
    Idle,
    /// Writing and verifying registers
    Configure,
    /// Waiting for the capture-busy acknowledgement
    Arm,
    /// Actively capturing and streaming
    Scanning,
    /// Scan finished (single mode)
    Complete,
    /// Fault recovery in progress
    Error,
}

/// Pipeline counters carried in a GET_STATUS response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    /// Frames accepted from the capture source
    pub frames_received: u64,
    /// Frames fully transmitted (or consumed, on the host side)
    pub frames_sent: u64,
    /// Frames discarded by ring overflow or send failure
    pub frames_dropped: u64,
    /// Control datagrams rejected for authentication or replay
    pub auth_failures: u64,
    /// Data packets rejected for CRC/consistency errors
    pub crc_errors: u64,
    /// Reassembly slots evicted on timeout or pressure
    pub reassembly_timeouts: u64,
}

/// Health summary carried in a GET_STATUS response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthFlags {
    /// Data-path link considered up
    pub link_up: bool,
    /// Unrecovered device fault pending
    pub device_fault: bool,
}

/// Body of a GET_STATUS response.
///
/// Built entirely from cached state so the 50 ms response deadline holds
/// without a device round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusBody {
    /// Current scan phase
    pub phase: ScanPhase,
    /// Mode of the active scan, if any
    pub active_mode: Option<ScanMode>,
    /// Counter snapshot
    pub counters: CounterSnapshot,
    /// Health flags
    pub health: HealthFlags,
}

/// Body of a non-status response: a short human-readable diagnostic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckBody {
    /// Empty on success; reason text on ERROR/BUSY
    pub detail: String,
}

impl AckBody {
    /// An empty OK acknowledgement.
    #[must_use]
    pub fn ok() -> Self {
        Self::default()
    }

    /// An acknowledgement carrying a diagnostic.
    #[must_use]
    pub fn with_detail(detail: impl Into<String>) -> Self {
        Self { detail: detail.into() }
    }
}

/// Encode a body to CBOR bytes.
///
/// # Errors
///
/// - [`ProtocolError::PayloadCodec`] if serialization fails
pub fn encode_body<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out)
        .map_err(|e| ProtocolError::PayloadCodec(e.to_string()))?;
    Ok(out)
}

/// Decode a body from CBOR bytes.
///
/// # Errors
///
/// - [`ProtocolError::PayloadCodec`] if the bytes are not valid CBOR for `T`
pub fn decode_body<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes).map_err(|e| ProtocolError::PayloadCodec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_scan_round_trip() {
        let body = StartScan { mode: ScanMode::Calibration, tier: 3 };
        let bytes = encode_body(&body).expect("encodes");
        let parsed: StartScan = decode_body(&bytes).expect("decodes");
        assert_eq!(body, parsed);
    }

    #[test]
    fn status_body_round_trip() {
        let body = StatusBody {
            phase: ScanPhase::Scanning,
            active_mode: Some(ScanMode::Continuous),
            counters: CounterSnapshot { frames_received: 12, frames_sent: 8, ..Default::default() },
            health: HealthFlags { link_up: true, device_fault: false },
        };
        let bytes = encode_body(&body).expect("encodes");
        let parsed: StatusBody = decode_body(&bytes).expect("decodes");
        assert_eq!(body, parsed);
    }

    #[test]
    fn garbage_bytes_do_not_decode() {
        let result: Result<StartScan> = decode_body(&[0xFF, 0x00, 0x13, 0x37]);
        assert!(matches!(result, Err(ProtocolError::PayloadCodec(_))));
    }

    #[test]
    fn set_config_round_trip() {
        let body = SetConfig { key: "fps".to_string(), value: "30".to_string() };
        let bytes = encode_body(&body).expect("encodes");
        let parsed: SetConfig = decode_body(&bytes).expect("decodes");
        assert_eq!(body, parsed);
    }
}
