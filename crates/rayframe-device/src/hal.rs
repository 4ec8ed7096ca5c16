//! Hardware capability seams.
//!
//! The scan FSM drives real silicon through two narrow traits — a register
//! bus and a capture source — plus a health sink for the watchdog. Each has
//! a simulated implementation good enough to run the full pipeline in
//! process, which is what the end-to-end tests and `--simulate` mode use.

use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;
use rayframe_core::DetectorConfig;
use rayframe_proto::payloads::CounterSnapshot;

use crate::error::DeviceError;

/// Register map of the detector front-end.
///
/// Addresses and bit assignments mirror the FPGA register file; the scan FSM
/// only ever touches these.
pub mod regs {
    /// Control: write [`CTRL_START`] to arm, 0 to disarm.
    pub const CTRL: u8 = 0x00;
    /// Frame width in pixels.
    pub const WIDTH: u8 = 0x01;
    /// Frame height in pixels.
    pub const HEIGHT: u8 = 0x02;
    /// Pixel depth (14 or 16).
    pub const BIT_DEPTH: u8 = 0x03;
    /// Scan cadence, frames per second.
    pub const FPS: u8 = 0x04;
    /// Link rate code (0..=3).
    pub const LANE_SPEED: u8 = 0x05;
    /// Calibration bank row selected for calibration scans.
    pub const CAL_BANK: u8 = 0x06;
    /// Status bits, read-only: [`STATUS_BUSY`] | [`STATUS_FRAME_READY`] |
    /// [`STATUS_ERROR`].
    pub const STATUS: u8 = 0x10;
    /// Write 1 to acknowledge and clear a device fault.
    pub const ERR_CLEAR: u8 = 0x11;

    /// CTRL bit: begin producing frames.
    pub const CTRL_START: u16 = 0x0001;
    /// STATUS bit: capture engine armed and running.
    pub const STATUS_BUSY: u16 = 0x0001;
    /// STATUS bit: a completed frame awaits pickup.
    pub const STATUS_FRAME_READY: u16 = 0x0002;
    /// STATUS bit: device fault latched.
    pub const STATUS_ERROR: u16 = 0x0004;
}

/// Synchronous register access with bounded (≤10 ms) round-trips.
pub trait RegisterBus: Send + Sync + 'static {
    /// Write one register.
    fn write(&self, addr: u8, data: u16) -> Result<(), DeviceError>;

    /// Read one register back.
    fn read(&self, addr: u8) -> Result<u16, DeviceError>;
}

/// Zero-copy capture hand-off from the acquisition DMA.
///
/// `next_frame_buffer` yields the pixel bytes of one completed frame; the
/// buffer returns to the capture pool when the returned [`Bytes`] drops.
pub trait FrameSource: Send + 'static {
    /// Pixel bytes and capture timestamp of the next completed frame.
    fn next_frame_buffer(&mut self) -> Result<CapturedFrame, DeviceError>;
}

/// One frame as delivered by the capture engine.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// Capture timestamp, microseconds on the device clock
    pub timestamp_us: u64,
    /// Little-endian pixel bytes, `width * height * 2` of them
    pub pixels: Bytes,
}

/// Watchdog and statistics sink.
pub trait HealthSink: Send + Sync + 'static {
    /// Pet the watchdog.
    fn pet(&self);

    /// Periodic counter snapshot.
    fn snapshot(&self, counters: &CounterSnapshot);
}

/// Health sink that logs snapshots at DEBUG. The default when no platform
/// watchdog is wired up.
#[derive(Debug, Default)]
pub struct LogHealthSink;

impl HealthSink for LogHealthSink {
    fn pet(&self) {}

    fn snapshot(&self, counters: &CounterSnapshot) {
        tracing::debug!(
            frames_received = counters.frames_received,
            frames_sent = counters.frames_sent,
            frames_dropped = counters.frames_dropped,
            auth_failures = counters.auth_failures,
            crc_errors = counters.crc_errors,
            reassembly_timeouts = counters.reassembly_timeouts,
            "health snapshot"
        );
    }
}

/// In-process register file emulating the FPGA behavior the FSM depends on:
/// arming sets BUSY, frames become ready while armed, faults latch until
/// cleared.
///
/// Test knobs allow dropping writes (register-verify retries) and latching
/// faults on demand.
pub struct SimRegisterBus {
    state: Mutex<SimRegs>,
}

struct SimRegs {
    regs: HashMap<u8, u16>,
    /// addr -> number of upcoming writes to swallow (read returns stale).
    drop_writes: HashMap<u8, u32>,
    /// Status reads remaining until FRAME_READY asserts (0 = immediately).
    ready_after_polls: u32,
    /// Fault to latch on the next status read.
    pending_fault: bool,
    /// Error clears to swallow before one succeeds.
    fail_clears: u32,
}

impl SimRegisterBus {
    /// Fresh register file, everything zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimRegs {
                regs: HashMap::new(),
                drop_writes: HashMap::new(),
                ready_after_polls: 0,
                pending_fault: false,
                fail_clears: 0,
            }),
        }
    }

    /// Swallow the next `count` writes to `addr`; reads return the stale
    /// value, forcing the FSM's verify path to retry.
    pub fn drop_next_writes(&self, addr: u8, count: u32) {
        self.lock().drop_writes.insert(addr, count);
    }

    /// Assert FRAME_READY only after `polls` status reads while armed.
    pub fn set_ready_after_polls(&self, polls: u32) {
        self.lock().ready_after_polls = polls;
    }

    /// Latch a device fault on the next status read.
    pub fn inject_fault(&self) {
        self.lock().pending_fault = true;
    }

    /// Swallow the next `count` fault-clear writes.
    pub fn fail_next_clears(&self, count: u32) {
        self.lock().fail_clears = count;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimRegs> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for SimRegisterBus {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterBus for SimRegisterBus {
    fn write(&self, addr: u8, data: u16) -> Result<(), DeviceError> {
        let mut state = self.lock();

        if let Some(remaining) = state.drop_writes.get_mut(&addr) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(()); // silently lost, like a flaky SPI transfer
            }
        }

        match addr {
            regs::CTRL => {
                state.regs.insert(regs::CTRL, data);
                let mut status = state.regs.get(&regs::STATUS).copied().unwrap_or(0);
                if data & regs::CTRL_START != 0 {
                    status |= regs::STATUS_BUSY;
                } else {
                    status &= !(regs::STATUS_BUSY | regs::STATUS_FRAME_READY);
                }
                state.regs.insert(regs::STATUS, status);
            },
            regs::ERR_CLEAR => {
                if state.fail_clears > 0 {
                    state.fail_clears -= 1;
                } else {
                    let status = state.regs.get(&regs::STATUS).copied().unwrap_or(0);
                    state.regs.insert(regs::STATUS, status & !regs::STATUS_ERROR);
                }
            },
            _ => {
                state.regs.insert(addr, data);
            },
        }
        Ok(())
    }

    fn read(&self, addr: u8) -> Result<u16, DeviceError> {
        let mut state = self.lock();

        if addr == regs::STATUS {
            let mut status = state.regs.get(&regs::STATUS).copied().unwrap_or(0);

            if state.pending_fault {
                state.pending_fault = false;
                status |= regs::STATUS_ERROR;
            }

            if status & regs::STATUS_BUSY != 0 && status & regs::STATUS_ERROR == 0 {
                if state.ready_after_polls == 0 {
                    status |= regs::STATUS_FRAME_READY;
                } else {
                    state.ready_after_polls -= 1;
                }
            }

            state.regs.insert(regs::STATUS, status);
            return Ok(status);
        }

        Ok(state.regs.get(&addr).copied().unwrap_or(0))
    }
}

impl std::fmt::Debug for SimRegisterBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimRegisterBus").finish_non_exhaustive()
    }
}

/// Capture source generating the deterministic counter pattern
/// (`pixel[i] = i mod 65536`) at the configured geometry.
#[derive(Debug)]
pub struct SimFrameSource {
    width: u16,
    height: u16,
    frame_period_us: u64,
    clock_us: u64,
    /// Pattern generated once; every simulated frame shares it.
    pattern: Bytes,
}

impl SimFrameSource {
    /// Source matching `config`'s geometry and cadence.
    #[must_use]
    pub fn new(config: &DetectorConfig) -> Self {
        let pixels = u32::from(config.width) * u32::from(config.height);
        let pattern: Vec<u8> =
            (0..pixels).flat_map(|i| ((i % 65536) as u16).to_le_bytes()).collect();

        Self {
            width: config.width,
            height: config.height,
            frame_period_us: 1_000_000 / u64::from(config.fps.max(1)),
            clock_us: 0,
            pattern: Bytes::from(pattern),
        }
    }

    /// Configured width, pixels.
    #[must_use]
    pub fn width(&self) -> u16 {
        self.width
    }

    /// Configured height, pixels.
    #[must_use]
    pub fn height(&self) -> u16 {
        self.height
    }
}

impl FrameSource for SimFrameSource {
    fn next_frame_buffer(&mut self) -> Result<CapturedFrame, DeviceError> {
        self.clock_us += self.frame_period_us;
        // Bytes clone is a refcount bump, matching the zero-copy contract.
        Ok(CapturedFrame { timestamp_us: self.clock_us, pixels: self.pattern.clone() })
    }
}
