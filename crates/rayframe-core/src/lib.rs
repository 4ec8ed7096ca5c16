//! Core pipeline pieces shared by the detector daemon and the host SDK.
//!
//! Everything here is transport-agnostic:
//!
//! - [`Frame`]: one assembled image with its capture metadata.
//! - [`FrameRing`]: the four-slot producer/consumer hand-off with the
//!   oldest-drop overflow discipline. The producer never blocks.
//! - [`Reassembler`]: rebuilds frames from packets under loss, duplication
//!   and reordering. Pure logic — time is injected by the caller, so eviction
//!   behavior is deterministic under test.
//! - [`RingCounters`]: process-wide atomic statistics, readable without
//!   locks.
//! - [`DetectorConfig`]: the validated configuration document with its
//!   hot/cold key classification.

#![forbid(unsafe_code)]

pub mod config;
mod counters;
mod error;
mod frame;
mod reassembly;
mod ring;

pub use config::{ConfigError, DetectorConfig, KeyClass, LaneSpeed, LogLevel};
pub use counters::RingCounters;
pub use error::RingError;
pub use frame::Frame;
pub use reassembly::{Reassembler, ReassemblyConfig};
pub use ring::{FillSlot, FrameRing, RING_SLOTS, SendSlot, SlotMeta};
