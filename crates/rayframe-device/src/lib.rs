//! Ingest-side detector daemon.
//!
//! Wires the pure drivers ([`ScanDriver`], [`ControlDriver`]) to real I/O:
//! UDP sockets, the register bus, the capture source and the frame ring.
//! Task layout follows the concurrency model of the pipeline:
//!
//! - **control**: drains the control socket, runs the control driver,
//!   forwards scan requests to the FSM task.
//! - **fsm**: runs the scan driver, executing its actions against the
//!   register bus and capture source; publishes the cached status snapshot.
//! - **send**: pulls READY ring slots and transmits them as frame packets.
//! - **health**: pets the watchdog and snapshots counters once a second.
//!
//! Every task watches one shared shutdown signal; total shutdown stays under
//! the five-second budget because the send task caps its drain.

#![forbid(unsafe_code)]

pub mod control;
mod error;
pub mod hal;
pub mod scan;
mod transport;

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

pub use control::{CachedStatus, ControlAction, ControlDriver, ScanRequest};
pub use error::DeviceError;
pub use hal::{
    CapturedFrame, FrameSource, HealthSink, LogHealthSink, RegisterBus, SimFrameSource,
    SimRegisterBus, regs,
};
use rayframe_core::{DetectorConfig, FrameRing, RingCounters};
use rayframe_proto::HmacKey;
use rayframe_proto::payloads::{HealthFlags, ScanPhase};
pub use scan::{ScanAction, ScanDriver, ScanErrorKind, ScanEvent, ScanTimings};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
pub use transport::{FrameSender, SEND_RETRIES_PER_PACKET, SendOutcome};

/// Environment variable holding the hex-encoded pre-shared key.
pub const ENV_HMAC_KEY: &str = "DETECTOR_HMAC_KEY";

/// Shutdown drain budget for the send task.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// Load the control-channel key: `DETECTOR_HMAC_KEY` overrides the
/// configuration file.
pub fn load_key(config: &DetectorConfig) -> Result<HmacKey, DeviceError> {
    let hex_key = match std::env::var(ENV_HMAC_KEY) {
        Ok(value) => value,
        Err(_) => config
            .hmac_key
            .clone()
            .ok_or_else(|| DeviceError::Key("no hmac key in config or environment".to_string()))?,
    };

    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| DeviceError::Key(format!("hmac key is not valid hex: {e}")))?;
    if bytes.is_empty() {
        return Err(DeviceError::Key("hmac key must not be empty".to_string()));
    }
    Ok(HmacKey::new(bytes))
}

/// A scan request annotated with the commanding host.
#[derive(Debug, Clone, Copy)]
struct FsmMessage {
    request: ScanRequest,
    source: SocketAddr,
}

/// Outcome reports from the send task to the FSM task.
#[derive(Debug, Clone)]
enum SendReport {
    /// Frame fully transmitted
    Sent(u32),
    /// Frame abandoned after exhausting per-packet retries
    Failed(u32, String),
}

/// The assembled daemon.
///
/// Generic over the hardware seams so tests and `--simulate` runs use the
/// in-process implementations while production wires real drivers.
pub struct Device<B: RegisterBus, F: FrameSource, H: HealthSink> {
    config: DetectorConfig,
    key: HmacKey,
    bus: Arc<B>,
    source: F,
    health: Arc<H>,
    /// Fixed frame destination; `None` derives it from the START source.
    data_dest: Option<SocketAddr>,
}

/// A fully simulated device for tests and demos.
#[must_use]
pub fn simulated_device(
    config: DetectorConfig,
    key: HmacKey,
) -> Device<SimRegisterBus, SimFrameSource, LogHealthSink> {
    let source = SimFrameSource::new(&config);
    Device::new(config, key, Arc::new(SimRegisterBus::new()), source, Arc::new(LogHealthSink))
}

impl<B: RegisterBus, F: FrameSource, H: HealthSink> Device<B, F, H> {
    /// Assemble a daemon from its parts.
    pub fn new(
        config: DetectorConfig,
        key: HmacKey,
        bus: Arc<B>,
        source: F,
        health: Arc<H>,
    ) -> Self {
        Self { config, key, bus, source, health, data_dest: None }
    }

    /// Stream frames to a fixed destination instead of deriving it from the
    /// START command's source address.
    #[must_use]
    pub fn with_data_dest(mut self, dest: SocketAddr) -> Self {
        self.data_dest = Some(dest);
        self
    }

    /// Run until `shutdown` flips true. Returns the bound control address
    /// through `ready`, for tests that need to know the ephemeral port.
    pub async fn run(
        self,
        shutdown: watch::Receiver<bool>,
        ready: Option<tokio::sync::oneshot::Sender<SocketAddr>>,
    ) -> Result<(), DeviceError> {
        self.config.validate()?;

        let counters = Arc::new(RingCounters::new());
        let ring = FrameRing::new(self.config.frame_bytes(), Arc::clone(&counters));
        let config = Arc::new(RwLock::new(self.config.clone()));

        let control_socket =
            Arc::new(UdpSocket::bind(("0.0.0.0", self.config.control_port)).await?);
        let data_socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);

        let local = control_socket.local_addr()?;
        tracing::info!(control = %local, "device control plane listening");
        if let Some(ready) = ready {
            let _ = ready.send(local);
        }

        let (status_tx, status_rx) = watch::channel(CachedStatus {
            phase: ScanPhase::Idle,
            active_mode: None,
            health: HealthFlags { link_up: true, device_fault: false },
        });
        let (dest_tx, dest_rx) = watch::channel(self.data_dest);
        // Packet-granular scan interruption: STOP finishes the in-flight
        // packet, not the in-flight frame.
        let (halt_tx, halt_rx) = watch::channel(false);
        let (fsm_tx, fsm_rx) = mpsc::channel::<FsmMessage>(16);
        let (sent_tx, sent_rx) = mpsc::channel::<SendReport>(64);

        let control = tokio::spawn(control_task(
            Arc::clone(&control_socket),
            ControlDriver::new(self.key.clone(), Arc::clone(&counters)),
            Arc::clone(&config),
            status_rx.clone(),
            fsm_tx,
            shutdown.clone(),
        ));

        let fsm = tokio::spawn(
            FsmTask {
                driver: ScanDriver::new(self.config.clone(), ScanTimings::from_config(&self.config)),
                timings: ScanTimings::from_config(&self.config),
                bus: Arc::clone(&self.bus),
                source: self.source,
                ring: Arc::clone(&ring),
                counters: Arc::clone(&counters),
                config: Arc::clone(&config),
                status_tx,
                dest_tx,
                halt_tx,
                fixed_dest: self.data_dest,
                frame_seq: 0,
                pending_degraded: false,
                next_poll: None,
                device_fault: false,
            }
            .run(fsm_rx, sent_rx, shutdown.clone()),
        );

        let send = tokio::spawn(send_task(
            FrameSender::new(data_socket),
            Arc::clone(&ring),
            config,
            dest_rx,
            halt_rx,
            sent_tx,
            shutdown.clone(),
        ));

        let health = tokio::spawn(health_task(
            Arc::clone(&self.health),
            Arc::clone(&counters),
            shutdown,
        ));

        let _ = tokio::join!(control, fsm, send, health);
        ring.reset();
        tracing::info!("device shut down");
        Ok(())
    }
}

/// Control-plane task: decode, dispatch, respond.
async fn control_task(
    socket: Arc<UdpSocket>,
    mut driver: ControlDriver,
    config: Arc<RwLock<DetectorConfig>>,
    status_rx: watch::Receiver<CachedStatus>,
    fsm_tx: mpsc::Sender<FsmMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; 65536];
    loop {
        let (len, source) = tokio::select! {
            result = socket.recv_from(&mut buf) => match result {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::error!(error_kind = "recv", "control socket error: {err}");
                    continue;
                },
            },
            _ = shutdown.changed() => break,
        };

        let status = status_rx.borrow().clone();
        let actions = {
            let mut config = config.write().unwrap_or_else(std::sync::PoisonError::into_inner);
            driver.process_datagram(&buf[..len], source, &status, &mut config)
        };

        for action in actions {
            match action {
                ControlAction::Respond { dest, bytes } => {
                    if let Err(err) = socket.send_to(&bytes, dest).await {
                        tracing::warn!(%dest, "response send failed: {err}");
                    }
                },
                ControlAction::Forward(request) => {
                    if fsm_tx.send(FsmMessage { request, source }).await.is_err() {
                        tracing::error!("fsm task gone, dropping scan request");
                    }
                },
                ControlAction::ConfigChanged { key, .. } => {
                    tracing::debug!(%key, "configuration change applied");
                },
            }
        }
    }
    tracing::debug!("control task exiting");
}

/// The scan FSM task state.
struct FsmTask<B: RegisterBus, F: FrameSource> {
    driver: ScanDriver,
    timings: ScanTimings,
    bus: Arc<B>,
    source: F,
    ring: Arc<FrameRing>,
    counters: Arc<RingCounters>,
    config: Arc<RwLock<DetectorConfig>>,
    status_tx: watch::Sender<CachedStatus>,
    dest_tx: watch::Sender<Option<SocketAddr>>,
    /// True while a stop is pending; the send task aborts after its
    /// in-flight packet.
    halt_tx: watch::Sender<bool>,
    fixed_dest: Option<SocketAddr>,
    frame_seq: u32,
    pending_degraded: bool,
    next_poll: Option<Instant>,
    device_fault: bool,
}

impl<B: RegisterBus, F: FrameSource> FsmTask<B, F> {
    async fn run(
        mut self,
        mut fsm_rx: mpsc::Receiver<FsmMessage>,
        mut sent_rx: mpsc::Receiver<SendReport>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let poll_at = self.next_poll;
            let event = tokio::select! {
                message = fsm_rx.recv() => match message {
                    Some(message) => self.admit(message),
                    None => break,
                },
                report = sent_rx.recv() => match report {
                    Some(SendReport::Sent(frame_seq)) => {
                        Some(ScanEvent::FrameSent { frame_seq })
                    },
                    Some(SendReport::Failed(frame_seq, reason)) => {
                        Some(ScanEvent::CaptureFailed {
                            reason: format!("frame {frame_seq}: {reason}"),
                        })
                    },
                    None => break,
                },
                () = poll_sleep(poll_at), if poll_at.is_some() => {
                    self.next_poll = None;
                    self.poll_status()
                },
                _ = shutdown.changed() => {
                    let _ = self.halt_tx.send(true);
                    self.drive(ScanEvent::Stop).await;
                    break;
                },
            };

            if let Some(event) = event {
                self.drive(event).await;
            }
            self.publish_status();
        }
        tracing::debug!("fsm task exiting");
    }

    /// Translate a control-plane message, latching the frame destination.
    fn admit(&mut self, message: FsmMessage) -> Option<ScanEvent> {
        match message.request {
            ScanRequest::Start { mode, tier } => {
                let dest = self.fixed_dest.unwrap_or_else(|| {
                    let data_port = self.config_snapshot().data_port;
                    SocketAddr::new(message.source.ip(), data_port)
                });
                let _ = self.dest_tx.send(Some(dest));
                let _ = self.halt_tx.send(false);
                self.driver.set_config(self.config_snapshot());
                self.device_fault = false;
                tracing::info!(%dest, "frame destination latched");
                Some(ScanEvent::Start { mode, tier })
            },
            ScanRequest::Stop => {
                let _ = self.halt_tx.send(true);
                Some(ScanEvent::Stop)
            },
            ScanRequest::Reset => {
                let _ = self.halt_tx.send(true);
                Some(ScanEvent::Reset)
            },
        }
    }

    fn poll_status(&mut self) -> Option<ScanEvent> {
        match self.bus.read(regs::STATUS) {
            Ok(status) => Some(ScanEvent::DeviceStatus {
                busy: status & regs::STATUS_BUSY != 0,
                frame_ready: status & regs::STATUS_FRAME_READY != 0,
                fault: status & regs::STATUS_ERROR != 0,
            }),
            Err(err) => Some(ScanEvent::BusFailed { reason: err.to_string() }),
        }
    }

    /// Run the driver, executing actions until no follow-up events remain.
    async fn drive(&mut self, event: ScanEvent) {
        let mut queue = vec![event];
        while let Some(event) = queue.pop() {
            let actions = self.driver.process_event(event, Instant::now());
            for action in actions {
                if let Some(follow_up) = self.execute(action).await {
                    queue.push(follow_up);
                }
            }
        }
    }

    async fn execute(&mut self, action: ScanAction) -> Option<ScanEvent> {
        match action {
            ScanAction::WriteRegister { addr, value } => match self.bus.write(addr, value) {
                Ok(()) => None,
                Err(err) => Some(ScanEvent::BusFailed { reason: err.to_string() }),
            },
            ScanAction::ReadRegister { addr } => match self.bus.read(addr) {
                Ok(value) => Some(ScanEvent::RegisterReadBack { addr, value }),
                Err(err) => Some(ScanEvent::BusFailed { reason: err.to_string() }),
            },
            ScanAction::IssueArm => Some(self.issue_arm().await),
            ScanAction::Disarm => {
                if let Err(err) = self.bus.write(regs::CTRL, 0) {
                    tracing::warn!("disarm failed: {err}");
                }
                None
            },
            ScanAction::PollStatusAt { at } => {
                self.next_poll = Some(at);
                None
            },
            ScanAction::CaptureFrame => self.capture_frame(),
            ScanAction::ClearCounters => {
                self.counters.clear();
                None
            },
            ScanAction::ClearDeviceError => Some(self.clear_device_error()),
            ScanAction::NotifyControl { kind, detail } => {
                self.device_fault = true;
                tracing::error!(?kind, detail, "scan error surfaced to control plane");
                None
            },
            ScanAction::Log { level, message } => {
                match level {
                    scan::LogLevel::Debug => tracing::debug!("{message}"),
                    scan::LogLevel::Info => tracing::info!("{message}"),
                    scan::LogLevel::Warn => tracing::warn!("{message}"),
                    scan::LogLevel::Error => tracing::error!("{message}"),
                }
                None
            },
        }
    }

    /// Write the start bit, then sample busy until the arm deadline.
    async fn issue_arm(&mut self) -> ScanEvent {
        if let Err(err) = self.bus.write(regs::CTRL, regs::CTRL_START) {
            return ScanEvent::BusFailed { reason: err.to_string() };
        }

        let deadline = Instant::now() + self.timings.arm_timeout;
        loop {
            match self.bus.read(regs::STATUS) {
                Ok(status) if status & regs::STATUS_BUSY != 0 => {
                    return ScanEvent::ArmStatus { busy: true };
                },
                Ok(_) => {},
                Err(err) => return ScanEvent::BusFailed { reason: err.to_string() },
            }
            if Instant::now() >= deadline {
                return ScanEvent::ArmStatus { busy: false };
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Pull the next capture buffer and stage it through the ring.
    fn capture_frame(&mut self) -> Option<ScanEvent> {
        let captured = match self.source.next_frame_buffer() {
            Ok(captured) => captured,
            Err(err) => return Some(ScanEvent::CaptureFailed { reason: err.to_string() }),
        };

        let config = self.config_snapshot();
        let len = config.frame_bytes().min(captured.pixels.len());

        let mut slot = match self.ring.acquire_fill() {
            Ok(slot) => slot,
            Err(_) => {
                // Consumer holds every slot; the frame is lost here.
                self.counters.incr_frames_received();
                self.counters.incr_frames_dropped();
                self.pending_degraded = true;
                tracing::warn!(error_kind = "ring_overflow", "ring exhausted, frame lost");
                return None;
            },
        };

        let degraded = slot.evicted_frame() || self.pending_degraded;
        self.pending_degraded = false;

        slot.buf_mut()[..len].copy_from_slice(&captured.pixels[..len]);
        slot.commit(rayframe_core::SlotMeta {
            frame_seq: self.frame_seq,
            timestamp_us: captured.timestamp_us,
            width: config.width,
            height: config.height,
            bit_depth: config.bit_depth_enum(),
            len,
            degraded,
        });
        self.frame_seq += 1;
        None
    }

    fn clear_device_error(&mut self) -> ScanEvent {
        if let Err(err) = self.bus.write(regs::ERR_CLEAR, 1) {
            tracing::warn!("error clear write failed: {err}");
            return ScanEvent::ErrorCleared { ok: false };
        }
        match self.bus.read(regs::STATUS) {
            Ok(status) => ScanEvent::ErrorCleared { ok: status & regs::STATUS_ERROR == 0 },
            Err(_) => ScanEvent::ErrorCleared { ok: false },
        }
    }

    fn config_snapshot(&self) -> DetectorConfig {
        self.config.read().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    fn publish_status(&self) {
        let _ = self.status_tx.send(CachedStatus {
            phase: self.driver.phase(),
            active_mode: self.driver.active_mode(),
            health: HealthFlags { link_up: true, device_fault: self.device_fault },
        });
    }
}

async fn poll_sleep(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

/// Send task: drain READY slots into frame packets.
async fn send_task(
    sender: FrameSender,
    ring: Arc<FrameRing>,
    config: Arc<RwLock<DetectorConfig>>,
    dest_rx: watch::Receiver<Option<SocketAddr>>,
    halt_rx: watch::Receiver<bool>,
    sent_tx: mpsc::Sender<SendReport>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let slot = tokio::select! {
            slot = ring.acquire_send(Duration::from_millis(200)) => match slot {
                Ok(slot) => slot,
                Err(_) => continue, // nothing ready yet
            },
            _ = shutdown.changed() => break,
        };

        let Some(dest) = *dest_rx.borrow() else {
            tracing::warn!("frame ready but no destination latched, dropping");
            drop(slot);
            continue;
        };

        let frame_period = config
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .frame_period();

        let frame_seq = slot.meta().frame_seq;
        match sender.send_frame(&slot, dest, frame_period, &halt_rx).await {
            Ok(SendOutcome::Complete) => {
                slot.release();
                let _ = sent_tx.send(SendReport::Sent(frame_seq)).await;
            },
            Ok(SendOutcome::Interrupted) => {
                // Stop honored mid-frame; drop without release counts it.
                drop(slot);
            },
            Err(err) => {
                drop(slot);
                let _ = sent_tx.send(SendReport::Failed(frame_seq, err.to_string())).await;
            },
        }
    }

    // Shutdown drain: flush whatever is READY within the budget.
    let deadline = Instant::now() + SHUTDOWN_DRAIN;
    while Instant::now() < deadline {
        let Some(slot) = ring.try_acquire_send() else { break };
        let Some(dest) = *dest_rx.borrow() else {
            drop(slot);
            break;
        };
        let (_, unstopped) = watch::channel(false);
        match sender.send_frame(&slot, dest, SHUTDOWN_DRAIN, &unstopped).await {
            Ok(SendOutcome::Complete) => slot.release(),
            _ => drop(slot),
        }
    }
    tracing::debug!("send task exiting");
}

/// Health task: watchdog pets and counter snapshots.
async fn health_task<H: HealthSink>(
    health: Arc<H>,
    counters: Arc<RingCounters>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tick.tick() => {
                health.pet();
                health.snapshot(&counters.snapshot());
            },
            _ = shutdown.changed() => break,
        }
    }
    tracing::debug!("health task exiting");
}
