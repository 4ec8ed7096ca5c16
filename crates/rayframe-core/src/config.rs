//! Detector configuration.
//!
//! A flat YAML document with a fixed key set; unknown keys fail the load.
//! Each key is classified hot (appliable mid-scan) or cold (requires the
//! scan FSM to be idle) — the control plane consults [`classify`] before
//! applying a SET_CONFIG.

use std::path::Path;
use std::time::Duration;

use rayframe_proto::BitDepth;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::reassembly::ReassemblyConfig;

/// Configuration errors. Range violations name the offending key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Could not read the configuration file
    #[error("config io error: {0}")]
    Io(String),

    /// Document failed to parse (bad YAML or unknown key)
    #[error("config parse error: {0}")]
    Parse(String),

    /// A key's value fell outside its permitted range
    #[error("config key '{key}' out of range: got {value}, expected {expected}")]
    OutOfRange {
        /// Offending key
        key: &'static str,
        /// Rejected value, rendered
        value: String,
        /// Human-readable range description
        expected: &'static str,
    },

    /// SET_CONFIG named a key this build does not recognize
    #[error("unknown config key '{0}'")]
    UnknownKey(String),
}

/// Whether a key may change during an active scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyClass {
    /// Appliable immediately, scan or no scan
    Hot,
    /// Requires the FSM to be idle (responds BUSY otherwise)
    Cold,
}

/// Detector link rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LaneSpeed {
    /// 500 Mbit/s per lane
    #[serde(rename = "500mbps")]
    Mbps500,
    /// 1 Gbit/s per lane
    #[serde(rename = "1000mbps")]
    Mbps1000,
    /// 1.5 Gbit/s per lane
    #[serde(rename = "1500mbps")]
    Mbps1500,
    /// 2.5 Gbit/s per lane
    #[serde(rename = "2500mbps")]
    Mbps2500,
}

impl LaneSpeed {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "500mbps" => Some(Self::Mbps500),
            "1000mbps" => Some(Self::Mbps1000),
            "1500mbps" => Some(Self::Mbps1500),
            "2500mbps" => Some(Self::Mbps2500),
            _ => None,
        }
    }
}

/// Log verbosity, as the configuration file spells it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Everything
    Debug,
    /// Normal operation
    Info,
    /// Anomalies that recovered
    Warn,
    /// Failures
    Error,
    /// Fatal only
    Critical,
}

impl LogLevel {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" => Some(Self::Warn),
            "error" => Some(Self::Error),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }

    /// Directive string for a `tracing_subscriber` env filter.
    ///
    /// `critical` has no tracing level; it maps to `error` with everything
    /// below suppressed.
    #[must_use]
    pub fn as_filter_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error | Self::Critical => "error",
        }
    }
}

fn default_width() -> u16 {
    1024
}
fn default_height() -> u16 {
    1024
}
fn default_bit_depth() -> u16 {
    16
}
fn default_fps() -> u16 {
    15
}
fn default_data_port() -> u16 {
    8000
}
fn default_control_port() -> u16 {
    8001
}
fn default_lane_speed() -> LaneSpeed {
    LaneSpeed::Mbps1000
}
fn default_log_level() -> LogLevel {
    LogLevel::Info
}
fn default_reassembly_timeout_ms() -> u64 {
    2000
}
fn default_max_reassembly_slots() -> usize {
    8
}
fn default_status_poll_interval_us() -> u64 {
    100
}

/// The validated configuration document.
///
/// Construct through [`DetectorConfig::load`] or
/// [`DetectorConfig::from_yaml_str`]; both reject unknown keys and run
/// [`DetectorConfig::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetectorConfig {
    /// Frame width in pixels (128..=4096, cold)
    #[serde(default = "default_width")]
    pub width: u16,
    /// Frame height in pixels (128..=4096, cold)
    #[serde(default = "default_height")]
    pub height: u16,
    /// Pixel depth, 14 or 16 (cold)
    #[serde(default = "default_bit_depth")]
    pub bit_depth: u16,
    /// Scan cadence in frames per second (1..=60, hot)
    #[serde(default = "default_fps")]
    pub fps: u16,
    /// UDP port for frame data (1024..=65535, cold)
    #[serde(default = "default_data_port")]
    pub data_port: u16,
    /// UDP port for the control channel (1024..=65535, cold)
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// Link rate (cold)
    #[serde(default = "default_lane_speed")]
    pub lane_speed: LaneSpeed,
    /// Log verbosity (hot)
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,
    /// Reassembly slot eviction age in milliseconds (100..=10000, hot)
    #[serde(default = "default_reassembly_timeout_ms")]
    pub reassembly_timeout_ms: u64,
    /// Reorder capacity in slots (2..=32, cold)
    #[serde(default = "default_max_reassembly_slots")]
    pub max_reassembly_slots: usize,
    /// Emit zero-filled degraded frames on reassembly timeout (hot)
    #[serde(default)]
    pub emit_partial_on_timeout: bool,
    /// Zero the pipeline counters when a scan starts (hot)
    #[serde(default)]
    pub clear_counters_on_start: bool,
    /// Scan FSM status polling cadence in microseconds (10..=100_000, hot)
    #[serde(default = "default_status_poll_interval_us")]
    pub status_poll_interval_us: u64,
    /// Pre-shared control-channel key, hex-encoded.
    ///
    /// `DETECTOR_HMAC_KEY` in the environment overrides this. Not settable
    /// over SET_CONFIG — key rotation is out of scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac_key: Option<String>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            bit_depth: default_bit_depth(),
            fps: default_fps(),
            data_port: default_data_port(),
            control_port: default_control_port(),
            lane_speed: default_lane_speed(),
            log_level: default_log_level(),
            reassembly_timeout_ms: default_reassembly_timeout_ms(),
            max_reassembly_slots: default_max_reassembly_slots(),
            emit_partial_on_timeout: false,
            clear_counters_on_start: false,
            status_poll_interval_us: default_status_poll_interval_us(),
            hmac_key: None,
        }
    }
}

/// Classify a key, or `None` if unknown.
#[must_use]
pub fn classify(key: &str) -> Option<KeyClass> {
    match key {
        "width" | "height" | "bit_depth" | "data_port" | "control_port" | "lane_speed"
        | "max_reassembly_slots" => Some(KeyClass::Cold),
        "fps" | "log_level" | "reassembly_timeout_ms" | "emit_partial_on_timeout"
        | "clear_counters_on_start" | "status_poll_interval_us" => Some(KeyClass::Hot),
        _ => None,
    }
}

impl DetectorConfig {
    /// Load and validate from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text =
            std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_yaml_str(&text)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_yaml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every range constraint, naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn check<T: PartialOrd + std::fmt::Display + Copy>(
            key: &'static str,
            value: T,
            low: T,
            high: T,
            expected: &'static str,
        ) -> Result<(), ConfigError> {
            if value < low || value > high {
                return Err(ConfigError::OutOfRange { key, value: value.to_string(), expected });
            }
            Ok(())
        }

        check("width", self.width, 128, 4096, "128..=4096")?;
        check("height", self.height, 128, 4096, "128..=4096")?;
        if BitDepth::from_u16(self.bit_depth).is_none() {
            return Err(ConfigError::OutOfRange {
                key: "bit_depth",
                value: self.bit_depth.to_string(),
                expected: "14 or 16",
            });
        }
        check("fps", self.fps, 1, 60, "1..=60")?;
        check("data_port", self.data_port, 1024, 65535, "1024..=65535")?;
        check("control_port", self.control_port, 1024, 65535, "1024..=65535")?;
        check(
            "reassembly_timeout_ms",
            self.reassembly_timeout_ms,
            100,
            10_000,
            "100..=10000",
        )?;
        check("max_reassembly_slots", self.max_reassembly_slots, 2, 32, "2..=32")?;
        check(
            "status_poll_interval_us",
            self.status_poll_interval_us,
            10,
            100_000,
            "10..=100000",
        )?;
        Ok(())
    }

    /// Apply one `key = value` pair (the SET_CONFIG path), returning the
    /// key's classification so the caller can enforce cold-key rules.
    ///
    /// Validation happens before mutation: a rejected value leaves the
    /// configuration untouched.
    pub fn apply_kv(&mut self, key: &str, value: &str) -> Result<KeyClass, ConfigError> {
        fn parse_num<T: std::str::FromStr>(
            key: &'static str,
            value: &str,
            expected: &'static str,
        ) -> Result<T, ConfigError> {
            value.parse().map_err(|_| ConfigError::OutOfRange {
                key,
                value: value.to_string(),
                expected,
            })
        }

        let class = classify(key).ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;

        let mut candidate = self.clone();
        match key {
            "width" => candidate.width = parse_num("width", value, "128..=4096")?,
            "height" => candidate.height = parse_num("height", value, "128..=4096")?,
            "bit_depth" => candidate.bit_depth = parse_num("bit_depth", value, "14 or 16")?,
            "fps" => candidate.fps = parse_num("fps", value, "1..=60")?,
            "data_port" => candidate.data_port = parse_num("data_port", value, "1024..=65535")?,
            "control_port" => {
                candidate.control_port = parse_num("control_port", value, "1024..=65535")?;
            },
            "lane_speed" => {
                candidate.lane_speed =
                    LaneSpeed::parse(value).ok_or_else(|| ConfigError::OutOfRange {
                        key: "lane_speed",
                        value: value.to_string(),
                        expected: "500mbps|1000mbps|1500mbps|2500mbps",
                    })?;
            },
            "log_level" => {
                candidate.log_level =
                    LogLevel::parse(value).ok_or_else(|| ConfigError::OutOfRange {
                        key: "log_level",
                        value: value.to_string(),
                        expected: "debug|info|warn|error|critical",
                    })?;
            },
            "reassembly_timeout_ms" => {
                candidate.reassembly_timeout_ms =
                    parse_num("reassembly_timeout_ms", value, "100..=10000")?;
            },
            "max_reassembly_slots" => {
                candidate.max_reassembly_slots =
                    parse_num("max_reassembly_slots", value, "2..=32")?;
            },
            "emit_partial_on_timeout" => {
                candidate.emit_partial_on_timeout =
                    parse_num("emit_partial_on_timeout", value, "true or false")?;
            },
            "clear_counters_on_start" => {
                candidate.clear_counters_on_start =
                    parse_num("clear_counters_on_start", value, "true or false")?;
            },
            "status_poll_interval_us" => {
                candidate.status_poll_interval_us =
                    parse_num("status_poll_interval_us", value, "10..=100000")?;
            },
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }

        candidate.validate()?;
        *self = candidate;
        Ok(class)
    }

    /// Pixel depth as enum. Callers run after [`DetectorConfig::validate`],
    /// so the fallback never fires in practice.
    #[must_use]
    pub fn bit_depth_enum(&self) -> BitDepth {
        BitDepth::from_u16(self.bit_depth).unwrap_or(BitDepth::Sixteen)
    }

    /// Bytes in one frame at the configured geometry.
    #[must_use]
    pub fn frame_bytes(&self) -> usize {
        usize::from(self.width) * usize::from(self.height) * 2
    }

    /// Duration of one frame period at the configured cadence.
    #[must_use]
    pub fn frame_period(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.fps.max(1)))
    }

    /// Reassembler settings derived from this document.
    #[must_use]
    pub fn reassembly(&self) -> ReassemblyConfig {
        ReassemblyConfig {
            max_slots: self.max_reassembly_slots,
            timeout: Duration::from_millis(self.reassembly_timeout_ms),
            emit_partial_on_timeout: self.emit_partial_on_timeout,
        }
    }
}
