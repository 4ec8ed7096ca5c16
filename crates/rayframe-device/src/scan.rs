//! Scan sequencing state machine.
//!
//! Coordinates register configuration, arming, streaming and fault recovery.
//! Uses the action pattern: [`ScanDriver::process_event`] takes an event plus
//! the current time and returns actions for the runtime to execute against
//! the register bus, capture source, ring and transport. No I/O happens
//! here, which is what makes the sequencing testable.
//!
//! # State machine
//!
//! ```text
//! ┌──────┐ START  ┌───────────┐ verified ┌─────┐ busy  ┌──────────┐
//! │ IDLE │───────>│ CONFIGURE │─────────>│ ARM │──────>│ SCANNING │
//! └──────┘        └───────────┘          └─────┘       └──────────┘
//!    ▲               │ exhausted           │ timeout      │      │ frame sent
//!    │               ▼                     ▼              │      ▼
//!    │            ┌───────────────────────────┐    fault  │  ┌──────────┐
//!    └────────────│           ERROR           │<──────────┘  │ COMPLETE │
//!     recovered / └───────────────────────────┘              └──────────┘
//!     exhausted                            single → IDLE, continuous → ARM
//! ```
//!
//! STOP preempts every state and lands in IDLE; the runtime finishes the
//! in-flight packet (not the frame) before honoring it.

use std::time::{Duration, Instant};

use rayframe_core::{DetectorConfig, LaneSpeed};
use rayframe_proto::payloads::{ScanMode, ScanPhase};

use crate::hal::regs;

/// Default arm acknowledgement deadline.
pub const DEFAULT_ARM_TIMEOUT: Duration = Duration::from_millis(10);

/// Default read-back verify retries per register.
pub const DEFAULT_REGISTER_VERIFY_RETRIES: u32 = 3;

/// Default fault clear-and-restart attempts.
pub const DEFAULT_FAULT_CLEAR_RETRIES: u32 = 3;

/// Error classes reported to the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanErrorKind {
    /// Socket or capture path failure
    Transport,
    /// A register refused to verify after all retries
    RegisterVerify,
    /// Device never acknowledged arming within the deadline
    ArmTimeout,
    /// Device fault latched during a scan
    DeviceFault,
    /// Scan interrupted by STOP — a clean exit, not a fault
    Cancelled,
}

/// Log levels for driver actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug information
    Debug,
    /// Informational message
    Info,
    /// Warning
    Warn,
    /// Error
    Error,
}

/// Events the scan driver processes. Produced by the runtime.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    /// Control plane requested a scan
    Start {
        /// Acquisition mode
        mode: ScanMode,
        /// Gain/calibration tier
        tier: u8,
    },
    /// Control plane requested stop
    Stop,
    /// Control plane requested reset
    Reset,
    /// Read-back value for the register the driver asked about
    RegisterReadBack {
        /// Register address
        addr: u8,
        /// Value read back
        value: u16,
    },
    /// Busy sampling outcome after [`ScanAction::IssueArm`]
    ArmStatus {
        /// Device reported busy within the arm deadline
        busy: bool,
    },
    /// Status poll outcome during SCANNING
    DeviceStatus {
        /// Capture engine running
        busy: bool,
        /// A completed frame awaits pickup
        frame_ready: bool,
        /// Device fault latched
        fault: bool,
    },
    /// The transmit side finished the last packet of a frame
    FrameSent {
        /// Sequence of the transmitted frame
        frame_seq: u32,
    },
    /// Capture or transmit failed terminally for the current frame
    CaptureFailed {
        /// Diagnostic
        reason: String,
    },
    /// The register bus itself failed (timeout, transfer error)
    BusFailed {
        /// Diagnostic
        reason: String,
    },
    /// Outcome of a [`ScanAction::ClearDeviceError`]
    ErrorCleared {
        /// The fault bit deasserted
        ok: bool,
    },
}

/// Actions the runtime executes on the driver's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanAction {
    /// Write one register
    WriteRegister {
        /// Register address
        addr: u8,
        /// Value to write
        value: u16,
    },
    /// Read one register and reply with [`ScanEvent::RegisterReadBack`]
    ReadRegister {
        /// Register address
        addr: u8,
    },
    /// Write the start bit, sample busy within the arm deadline, reply with
    /// [`ScanEvent::ArmStatus`]
    IssueArm,
    /// Clear the start bit
    Disarm,
    /// Read the status register at `at`, reply with
    /// [`ScanEvent::DeviceStatus`]
    PollStatusAt {
        /// Earliest instant to sample
        at: Instant,
    },
    /// Pull the next capture buffer and stage it through the ring
    CaptureFrame,
    /// Zero the pipeline counters
    ClearCounters,
    /// Write the fault-clear register, reply with [`ScanEvent::ErrorCleared`]
    ClearDeviceError,
    /// Report an exhausted recovery to the control plane
    NotifyControl {
        /// Error class
        kind: ScanErrorKind,
        /// Diagnostic
        detail: String,
    },
    /// Emit a log line
    Log {
        /// Severity
        level: LogLevel,
        /// Message
        message: String,
    },
}

/// Driver tuning.
#[derive(Debug, Clone)]
pub struct ScanTimings {
    /// Deadline for the busy acknowledgement after arming
    pub arm_timeout: Duration,
    /// Read-back verify retries per register
    pub register_verify_retries: u32,
    /// Fault clear-and-restart attempts before giving up
    pub fault_clear_retries: u32,
    /// Status polling cadence while scanning
    pub poll_interval: Duration,
}

impl Default for ScanTimings {
    fn default() -> Self {
        Self {
            arm_timeout: DEFAULT_ARM_TIMEOUT,
            register_verify_retries: DEFAULT_REGISTER_VERIFY_RETRIES,
            fault_clear_retries: DEFAULT_FAULT_CLEAR_RETRIES,
            poll_interval: Duration::from_micros(100),
        }
    }
}

impl ScanTimings {
    /// Timings derived from a configuration document.
    #[must_use]
    pub fn from_config(config: &DetectorConfig) -> Self {
        Self {
            poll_interval: Duration::from_micros(config.status_poll_interval_us),
            ..Self::default()
        }
    }
}

/// Driver state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Configure { index: usize, retries: u32 },
    Arm,
    Scanning,
    Error { kind: ScanErrorKind, clear_attempts: u32 },
}

/// The scan sequencing driver.
///
/// Owns the register plan for the active scan and the retry bookkeeping.
/// One instance per device, driven by the FSM task.
#[derive(Debug)]
pub struct ScanDriver {
    state: State,
    timings: ScanTimings,
    config: DetectorConfig,
    /// Register plan for the active scan, built at START.
    plan: Vec<(u8, u16)>,
    mode: Option<ScanMode>,
    clear_counters_on_start: bool,
    /// Frames captured since the last arm; bounds single-shot scans to one.
    captured_since_arm: u32,
}

impl ScanDriver {
    /// New driver in IDLE.
    #[must_use]
    pub fn new(config: DetectorConfig, timings: ScanTimings) -> Self {
        let clear = config.clear_counters_on_start;
        Self {
            state: State::Idle,
            timings,
            config,
            plan: Vec::new(),
            mode: None,
            clear_counters_on_start: clear,
            captured_since_arm: 0,
        }
    }

    /// Adopt an updated configuration (applies to the next scan).
    pub fn set_config(&mut self, config: DetectorConfig) {
        self.clear_counters_on_start = config.clear_counters_on_start;
        self.timings.poll_interval = Duration::from_micros(config.status_poll_interval_us);
        self.config = config;
    }

    /// Wire-visible phase for GET_STATUS.
    #[must_use]
    pub fn phase(&self) -> ScanPhase {
        match self.state {
            State::Idle => ScanPhase::Idle,
            State::Configure { .. } => ScanPhase::Configure,
            State::Arm => ScanPhase::Arm,
            State::Scanning => ScanPhase::Scanning,
            State::Error { .. } => ScanPhase::Error,
        }
    }

    /// Mode of the active scan, if one is running.
    #[must_use]
    pub fn active_mode(&self) -> Option<ScanMode> {
        self.mode
    }

    /// Whether an unrecovered fault is pending.
    #[must_use]
    pub fn faulted(&self) -> bool {
        matches!(self.state, State::Error { .. })
    }

    /// Process one event, returning the actions to execute.
    pub fn process_event(&mut self, event: ScanEvent, now: Instant) -> Vec<ScanAction> {
        match event {
            ScanEvent::Start { mode, tier } => self.handle_start(mode, tier),
            ScanEvent::Stop => self.handle_stop(),
            ScanEvent::Reset => self.handle_reset(),
            ScanEvent::RegisterReadBack { addr, value } => self.handle_read_back(addr, value),
            ScanEvent::ArmStatus { busy } => self.handle_arm_status(busy, now),
            ScanEvent::DeviceStatus { busy, frame_ready, fault } => {
                self.handle_device_status(busy, frame_ready, fault, now)
            },
            ScanEvent::FrameSent { frame_seq } => self.handle_frame_sent(frame_seq),
            ScanEvent::CaptureFailed { reason } => self.enter_error(ScanErrorKind::Transport, reason),
            ScanEvent::BusFailed { reason } => {
                self.enter_error(ScanErrorKind::RegisterVerify, reason)
            },
            ScanEvent::ErrorCleared { ok } => self.handle_error_cleared(ok),
        }
    }

    fn handle_start(&mut self, mode: ScanMode, tier: u8) -> Vec<ScanAction> {
        if self.state != State::Idle {
            return vec![ScanAction::Log {
                level: LogLevel::Warn,
                message: format!("START ignored in {:?}", self.phase()),
            }];
        }

        self.plan = build_plan(&self.config, mode, tier);
        self.mode = Some(mode);
        self.state = State::Configure { index: 0, retries: 0 };

        let mut actions = Vec::new();
        if self.clear_counters_on_start {
            actions.push(ScanAction::ClearCounters);
        }
        actions.push(ScanAction::Log {
            level: LogLevel::Info,
            message: format!("scan start: mode {mode:?}, tier {tier}, {} registers", self.plan.len()),
        });
        let (addr, value) = self.plan[0];
        actions.push(ScanAction::WriteRegister { addr, value });
        actions.push(ScanAction::ReadRegister { addr });
        actions
    }

    fn handle_stop(&mut self) -> Vec<ScanAction> {
        if self.state == State::Idle {
            return Vec::new();
        }

        self.state = State::Idle;
        self.mode = None;
        vec![
            ScanAction::Disarm,
            ScanAction::Log { level: LogLevel::Info, message: "scan stopped".to_string() },
        ]
    }

    fn handle_reset(&mut self) -> Vec<ScanAction> {
        self.state = State::Idle;
        self.mode = None;
        self.plan.clear();
        vec![
            ScanAction::Disarm,
            ScanAction::ClearCounters,
            ScanAction::Log { level: LogLevel::Info, message: "device reset".to_string() },
        ]
    }

    fn handle_read_back(&mut self, addr: u8, value: u16) -> Vec<ScanAction> {
        let State::Configure { index, retries } = self.state else {
            return Vec::new(); // stale read-back after a STOP or fault
        };

        let (expected_addr, expected_value) = self.plan[index];
        if addr != expected_addr {
            return Vec::new();
        }

        if value == expected_value {
            let next = index + 1;
            if next == self.plan.len() {
                self.state = State::Arm;
                return vec![
                    ScanAction::Log {
                        level: LogLevel::Debug,
                        message: format!("{} registers verified, arming", self.plan.len()),
                    },
                    ScanAction::IssueArm,
                ];
            }

            self.state = State::Configure { index: next, retries: 0 };
            let (addr, value) = self.plan[next];
            return vec![
                ScanAction::WriteRegister { addr, value },
                ScanAction::ReadRegister { addr },
            ];
        }

        // Mismatch: retry the same register until the budget runs out.
        if retries < self.timings.register_verify_retries {
            self.state = State::Configure { index, retries: retries + 1 };
            return vec![
                ScanAction::Log {
                    level: LogLevel::Warn,
                    message: format!(
                        "register {expected_addr:#04x} read back {value:#06x}, \
                         expected {expected_value:#06x} (retry {})",
                        retries + 1
                    ),
                },
                ScanAction::WriteRegister { addr: expected_addr, value: expected_value },
                ScanAction::ReadRegister { addr: expected_addr },
            ];
        }

        self.enter_error(
            ScanErrorKind::RegisterVerify,
            format!("register {expected_addr:#04x} failed verify after retries"),
        )
    }

    fn handle_arm_status(&mut self, busy: bool, now: Instant) -> Vec<ScanAction> {
        if self.state != State::Arm {
            return Vec::new();
        }

        if busy {
            self.state = State::Scanning;
            self.captured_since_arm = 0;
            return vec![
                ScanAction::Log { level: LogLevel::Info, message: "armed, scanning".to_string() },
                ScanAction::PollStatusAt { at: now },
            ];
        }

        self.enter_error(ScanErrorKind::ArmTimeout, "no busy acknowledgement".to_string())
    }

    fn handle_device_status(
        &mut self,
        busy: bool,
        frame_ready: bool,
        fault: bool,
        now: Instant,
    ) -> Vec<ScanAction> {
        if self.state != State::Scanning {
            return Vec::new();
        }

        if fault {
            return self.enter_error(ScanErrorKind::DeviceFault, "device fault latched".to_string());
        }

        if !busy {
            return self.enter_error(
                ScanErrorKind::DeviceFault,
                "capture engine stopped unexpectedly".to_string(),
            );
        }

        // One capture per arm cycle: single-shot modes wait for the frame to
        // finish sending, and continuous mode re-arms per frame anyway.
        let next_poll = ScanAction::PollStatusAt { at: now + self.timings.poll_interval };
        if frame_ready && self.captured_since_arm == 0 {
            self.captured_since_arm += 1;
            vec![ScanAction::CaptureFrame, next_poll]
        } else {
            vec![next_poll]
        }
    }

    fn handle_frame_sent(&mut self, frame_seq: u32) -> Vec<ScanAction> {
        if self.state != State::Scanning {
            return Vec::new();
        }

        match self.mode {
            Some(ScanMode::Single | ScanMode::Calibration) => {
                // COMPLETE: single-shot scans return to idle.
                self.state = State::Idle;
                self.mode = None;
                vec![
                    ScanAction::Disarm,
                    ScanAction::Log {
                        level: LogLevel::Info,
                        message: format!("frame {frame_seq} sent, scan complete"),
                    },
                ]
            },
            Some(ScanMode::Continuous) => {
                // COMPLETE: continuous scans re-arm for the next frame.
                self.state = State::Arm;
                vec![ScanAction::IssueArm]
            },
            None => Vec::new(),
        }
    }

    fn handle_error_cleared(&mut self, ok: bool) -> Vec<ScanAction> {
        let State::Error { kind, clear_attempts } = self.state else {
            return Vec::new();
        };

        if ok {
            self.state = State::Idle;
            self.mode = None;
            return vec![ScanAction::Log {
                level: LogLevel::Info,
                message: format!("recovered from {kind:?}"),
            }];
        }

        let attempts = clear_attempts + 1;
        if attempts < self.timings.fault_clear_retries {
            self.state = State::Error { kind, clear_attempts: attempts };
            return vec![ScanAction::ClearDeviceError];
        }

        // Recovery exhausted: surface to the control plane and go idle.
        self.state = State::Idle;
        self.mode = None;
        vec![
            ScanAction::NotifyControl {
                kind,
                detail: format!("error clear failed after {attempts} attempts"),
            },
            ScanAction::Log {
                level: LogLevel::Error,
                message: format!("{kind:?} recovery exhausted"),
            },
        ]
    }

    fn enter_error(&mut self, kind: ScanErrorKind, detail: String) -> Vec<ScanAction> {
        self.state = State::Error { kind, clear_attempts: 0 };
        vec![
            ScanAction::Log { level: LogLevel::Error, message: format!("{kind:?}: {detail}") },
            ScanAction::Disarm,
            ScanAction::ClearDeviceError,
        ]
    }
}

/// Register plan for a scan: geometry first, then rate, then mode extras.
fn build_plan(config: &DetectorConfig, mode: ScanMode, tier: u8) -> Vec<(u8, u16)> {
    let mut plan = vec![
        (regs::WIDTH, config.width),
        (regs::HEIGHT, config.height),
        (regs::BIT_DEPTH, config.bit_depth),
        (regs::FPS, config.fps),
        (regs::LANE_SPEED, lane_code(config.lane_speed)),
    ];
    if mode == ScanMode::Calibration {
        plan.push((regs::CAL_BANK, u16::from(tier)));
    }
    plan
}

/// Lane-speed code as the FPGA register file encodes it.
fn lane_code(speed: LaneSpeed) -> u16 {
    match speed {
        LaneSpeed::Mbps500 => 0,
        LaneSpeed::Mbps1000 => 1,
        LaneSpeed::Mbps1500 => 2,
        LaneSpeed::Mbps2500 => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> ScanDriver {
        ScanDriver::new(DetectorConfig::default(), ScanTimings::default())
    }

    /// Walk the configure phase answering every read-back correctly.
    fn configure_cleanly(driver: &mut ScanDriver, now: Instant) {
        let actions = driver.process_event(
            ScanEvent::Start { mode: ScanMode::Single, tier: 0 },
            now,
        );
        let mut pending = pending_read(&actions);

        while driver.phase() == ScanPhase::Configure {
            let (addr, value) = pending.expect("configure always leaves a read pending");
            let actions =
                driver.process_event(ScanEvent::RegisterReadBack { addr, value }, now);
            pending = pending_read(&actions);
        }
    }

    /// Extract the (addr, expected_value) of a Write+Read action pair.
    fn pending_read(actions: &[ScanAction]) -> Option<(u8, u16)> {
        let mut write = None;
        for action in actions {
            match action {
                ScanAction::WriteRegister { addr, value } => write = Some((*addr, *value)),
                ScanAction::ReadRegister { addr } => {
                    let (waddr, value) = write?;
                    assert_eq!(*addr, waddr, "read must follow its write");
                    return Some((waddr, value));
                },
                _ => {},
            }
        }
        None
    }

    #[test]
    fn clean_configure_reaches_arm() {
        let mut d = driver();
        let now = Instant::now();
        configure_cleanly(&mut d, now);
        assert_eq!(d.phase(), ScanPhase::Arm);
    }

    #[test]
    fn verify_mismatch_twice_then_success_never_errors() {
        // Scenario: the first register reads back wrong twice, right on the
        // third attempt. The FSM must reach ARM without entering ERROR.
        let mut d = driver();
        let now = Instant::now();

        let actions =
            d.process_event(ScanEvent::Start { mode: ScanMode::Single, tier: 0 }, now);
        let (addr, expected) = pending_read(&actions).expect("first register pending");

        for _ in 0..2 {
            let actions = d.process_event(
                ScanEvent::RegisterReadBack { addr, value: expected ^ 0xFFFF },
                now,
            );
            assert_eq!(d.phase(), ScanPhase::Configure);
            assert!(pending_read(&actions).is_some(), "retry re-issues write+read");
        }

        // Third attempt verifies; walk the rest cleanly.
        let mut pending =
            pending_read(&d.process_event(ScanEvent::RegisterReadBack { addr, value: expected }, now));
        while d.phase() == ScanPhase::Configure {
            let (addr, value) = pending.expect("read pending");
            pending = pending_read(&d.process_event(ScanEvent::RegisterReadBack { addr, value }, now));
        }

        assert_eq!(d.phase(), ScanPhase::Arm);
    }

    #[test]
    fn verify_exhaustion_enters_error() {
        let mut d = driver();
        let now = Instant::now();

        let actions =
            d.process_event(ScanEvent::Start { mode: ScanMode::Single, tier: 0 }, now);
        let (addr, _) = pending_read(&actions).expect("first register pending");

        // Initial mismatch plus three failed retries exhausts the budget.
        for _ in 0..4 {
            d.process_event(ScanEvent::RegisterReadBack { addr, value: 0xBAAD }, now);
        }

        assert_eq!(d.phase(), ScanPhase::Error);
    }

    #[test]
    fn arm_ack_enters_scanning_and_polls() {
        let mut d = driver();
        let now = Instant::now();
        configure_cleanly(&mut d, now);

        let actions = d.process_event(ScanEvent::ArmStatus { busy: true }, now);
        assert_eq!(d.phase(), ScanPhase::Scanning);
        assert!(actions.iter().any(|a| matches!(a, ScanAction::PollStatusAt { .. })));
    }

    #[test]
    fn arm_timeout_enters_error() {
        let mut d = driver();
        let now = Instant::now();
        configure_cleanly(&mut d, now);

        let actions = d.process_event(ScanEvent::ArmStatus { busy: false }, now);
        assert_eq!(d.phase(), ScanPhase::Error);
        assert!(actions.iter().any(|a| matches!(a, ScanAction::ClearDeviceError)));
    }

    #[test]
    fn frame_ready_triggers_capture() {
        let mut d = driver();
        let now = Instant::now();
        configure_cleanly(&mut d, now);
        d.process_event(ScanEvent::ArmStatus { busy: true }, now);

        let actions = d.process_event(
            ScanEvent::DeviceStatus { busy: true, frame_ready: true, fault: false },
            now,
        );
        assert!(actions.contains(&ScanAction::CaptureFrame));
        assert!(actions.iter().any(|a| matches!(a, ScanAction::PollStatusAt { .. })));
    }

    #[test]
    fn poll_cadence_follows_configured_interval() {
        let config = DetectorConfig { status_poll_interval_us: 250, ..Default::default() };
        let mut d = ScanDriver::new(config.clone(), ScanTimings::from_config(&config));
        let now = Instant::now();
        configure_cleanly(&mut d, now);
        d.process_event(ScanEvent::ArmStatus { busy: true }, now);

        let actions = d.process_event(
            ScanEvent::DeviceStatus { busy: true, frame_ready: false, fault: false },
            now,
        );
        let at = actions
            .iter()
            .find_map(|a| match a {
                ScanAction::PollStatusAt { at } => Some(*at),
                _ => None,
            })
            .expect("poll scheduled");
        assert_eq!(at - now, Duration::from_micros(250));
    }

    #[test]
    fn single_mode_completes_to_idle_after_frame_sent() {
        let mut d = driver();
        let now = Instant::now();
        configure_cleanly(&mut d, now);
        d.process_event(ScanEvent::ArmStatus { busy: true }, now);

        let actions = d.process_event(ScanEvent::FrameSent { frame_seq: 0 }, now);
        assert_eq!(d.phase(), ScanPhase::Idle);
        assert_eq!(d.active_mode(), None);
        assert!(actions.contains(&ScanAction::Disarm));
    }

    #[test]
    fn continuous_mode_rearms_after_frame_sent() {
        let mut d = driver();
        let now = Instant::now();
        let actions =
            d.process_event(ScanEvent::Start { mode: ScanMode::Continuous, tier: 0 }, now);
        let mut pending = pending_read(&actions);
        while d.phase() == ScanPhase::Configure {
            let (addr, value) = pending.expect("read pending");
            pending = pending_read(&d.process_event(ScanEvent::RegisterReadBack { addr, value }, now));
        }
        d.process_event(ScanEvent::ArmStatus { busy: true }, now);

        let actions = d.process_event(ScanEvent::FrameSent { frame_seq: 5 }, now);
        assert_eq!(d.phase(), ScanPhase::Arm);
        assert!(actions.contains(&ScanAction::IssueArm));
        assert_eq!(d.active_mode(), Some(ScanMode::Continuous));
    }

    #[test]
    fn calibration_plan_selects_bank() {
        let config = DetectorConfig::default();
        let plan = build_plan(&config, ScanMode::Calibration, 3);
        assert!(plan.contains(&(regs::CAL_BANK, 3)));

        let plan = build_plan(&config, ScanMode::Single, 3);
        assert!(!plan.iter().any(|(addr, _)| *addr == regs::CAL_BANK));
    }

    #[test]
    fn stop_preempts_scanning() {
        let mut d = driver();
        let now = Instant::now();
        configure_cleanly(&mut d, now);
        d.process_event(ScanEvent::ArmStatus { busy: true }, now);
        assert_eq!(d.phase(), ScanPhase::Scanning);

        let actions = d.process_event(ScanEvent::Stop, now);
        assert_eq!(d.phase(), ScanPhase::Idle);
        assert!(actions.contains(&ScanAction::Disarm));
    }

    #[test]
    fn fault_recovery_succeeds() {
        let mut d = driver();
        let now = Instant::now();
        configure_cleanly(&mut d, now);
        d.process_event(ScanEvent::ArmStatus { busy: true }, now);

        let actions = d.process_event(
            ScanEvent::DeviceStatus { busy: true, frame_ready: false, fault: true },
            now,
        );
        assert_eq!(d.phase(), ScanPhase::Error);
        assert!(actions.contains(&ScanAction::ClearDeviceError));

        let actions = d.process_event(ScanEvent::ErrorCleared { ok: true }, now);
        assert_eq!(d.phase(), ScanPhase::Idle);
        assert!(!actions.iter().any(|a| matches!(a, ScanAction::NotifyControl { .. })));
    }

    #[test]
    fn fault_recovery_exhaustion_notifies_control() {
        let mut d = driver();
        let now = Instant::now();
        configure_cleanly(&mut d, now);
        d.process_event(ScanEvent::ArmStatus { busy: true }, now);
        d.process_event(
            ScanEvent::DeviceStatus { busy: true, frame_ready: false, fault: true },
            now,
        );

        let mut notified = false;
        for _ in 0..DEFAULT_FAULT_CLEAR_RETRIES {
            let actions = d.process_event(ScanEvent::ErrorCleared { ok: false }, now);
            notified |= actions.iter().any(|a| {
                matches!(a, ScanAction::NotifyControl { kind: ScanErrorKind::DeviceFault, .. })
            });
        }

        assert!(notified, "exhaustion must notify the control plane");
        assert_eq!(d.phase(), ScanPhase::Idle);
    }

    #[test]
    fn start_while_active_is_ignored() {
        let mut d = driver();
        let now = Instant::now();
        configure_cleanly(&mut d, now);
        assert_eq!(d.phase(), ScanPhase::Arm);

        let actions =
            d.process_event(ScanEvent::Start { mode: ScanMode::Continuous, tier: 0 }, now);
        assert_eq!(d.phase(), ScanPhase::Arm);
        assert!(matches!(actions[0], ScanAction::Log { level: LogLevel::Warn, .. }));
    }

    #[test]
    fn clear_counters_on_start_when_configured() {
        let config = DetectorConfig { clear_counters_on_start: true, ..Default::default() };
        let mut d = ScanDriver::new(config, ScanTimings::default());
        let actions = d.process_event(
            ScanEvent::Start { mode: ScanMode::Single, tier: 0 },
            Instant::now(),
        );
        assert_eq!(actions[0], ScanAction::ClearCounters);
    }
}
