//! The detector client.
//!
//! [`Client::connect`] binds the data endpoint, spawns the reception
//! pipeline and connects the authenticated control channel. Frames are
//! consumed through [`Client::frames`] — a lazy, pull-based stream backed by
//! the frame ring, so a slow caller sheds the oldest frames instead of
//! back-pressuring the network.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use rayframe_core::{DetectorConfig, Frame, FrameRing, Reassembler, RingCounters};
use rayframe_proto::{
    CommandId, HmacKey, ProtocolError, ResponseStatus, decode_response, encode_command,
    payloads::{
        AckBody, CounterSnapshot, ScanMode, SetConfig, StartScan, StatusBody, decode_body,
        encode_body,
    },
};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::ClientError;
use crate::receiver::{INTAKE_CAPACITY, IntakeQueue, decode_task, recv_task};

/// Default deadline for a control-channel response.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Connection parameters.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Device control endpoint
    pub device: SocketAddr,
    /// Detector configuration (geometry, ports, reassembly tuning)
    pub config: DetectorConfig,
    /// Pre-shared control-channel key
    pub key: HmacKey,
    /// How long to wait for a control response
    pub response_timeout: Duration,
}

impl ClientConfig {
    /// Parameters with the default response timeout.
    #[must_use]
    pub fn new(device: SocketAddr, config: DetectorConfig, key: HmacKey) -> Self {
        Self { device, config, key, response_timeout: DEFAULT_RESPONSE_TIMEOUT }
    }
}

/// The connected client.
pub struct Client {
    control: UdpSocket,
    device: SocketAddr,
    key: HmacKey,
    sequence: u32,
    response_timeout: Duration,
    ring: Arc<FrameRing>,
    counters: Arc<RingCounters>,
    cached_status: Mutex<Option<StatusBody>>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Client {
    /// Bind the data endpoint, start the reception pipeline and prepare the
    /// control channel.
    pub async fn connect(params: ClientConfig) -> Result<Self, ClientError> {
        params.config.validate().map_err(|e| ClientError::Protocol(e.to_string()))?;

        let counters = Arc::new(RingCounters::new());
        let ring = FrameRing::new(params.config.frame_bytes(), Arc::clone(&counters));
        let reassembler =
            Reassembler::new(params.config.reassembly(), Arc::clone(&counters));

        let data_socket =
            Arc::new(UdpSocket::bind(("0.0.0.0", params.config.data_port)).await?);
        let control = UdpSocket::bind("0.0.0.0:0").await?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let queue = IntakeQueue::new(INTAKE_CAPACITY);

        let tasks = vec![
            tokio::spawn(recv_task(data_socket, Arc::clone(&queue), shutdown_rx.clone())),
            tokio::spawn(decode_task(
                queue,
                reassembler,
                Arc::clone(&ring),
                Arc::clone(&counters),
                shutdown_rx,
            )),
        ];

        tracing::info!(device = %params.device, data_port = params.config.data_port, "client connected");

        Ok(Self {
            control,
            device: params.device,
            key: params.key,
            sequence: 0,
            response_timeout: params.response_timeout,
            ring,
            counters,
            cached_status: Mutex::new(None),
            shutdown,
            tasks,
        })
    }

    /// Start a scan in `mode` (tier 0).
    pub async fn start_scan(&mut self, mode: ScanMode) -> Result<(), ClientError> {
        self.start_scan_tiered(mode, 0).await
    }

    /// Start a scan with an explicit gain/calibration tier.
    pub async fn start_scan_tiered(&mut self, mode: ScanMode, tier: u8) -> Result<(), ClientError> {
        let body = encode_body(&StartScan { mode, tier })
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        let response = self.request(CommandId::StartScan, &body).await?;
        expect_ok(response)
    }

    /// Stop the active scan.
    pub async fn stop_scan(&mut self) -> Result<(), ClientError> {
        let response = self.request(CommandId::StopScan, &[]).await?;
        expect_ok(response)
    }

    /// Reset the device to idle.
    pub async fn reset(&mut self) -> Result<(), ClientError> {
        let response = self.request(CommandId::Reset, &[]).await?;
        expect_ok(response)
    }

    /// Apply one configuration key on the device.
    pub async fn set_config(&mut self, key: &str, value: &str) -> Result<(), ClientError> {
        let body = encode_body(&SetConfig { key: key.to_string(), value: value.to_string() })
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        let response = self.request(CommandId::SetConfig, &body).await?;
        expect_ok(response)
    }

    /// Query the device and refresh the cached status.
    pub async fn refresh_status(&mut self) -> Result<StatusBody, ClientError> {
        let (status, payload) = self.request(CommandId::GetStatus, &[]).await?;
        if status != ResponseStatus::Ok {
            return Err(ClientError::Rejected(ack_detail(&payload)));
        }
        let body: StatusBody =
            decode_body(&payload).map_err(|e| ClientError::Protocol(e.to_string()))?;
        *self.lock_status() = Some(body.clone());
        Ok(body)
    }

    /// Last status received from the device. Non-blocking; `None` until the
    /// first [`Client::refresh_status`].
    #[must_use]
    pub fn get_status(&self) -> Option<StatusBody> {
        self.lock_status().clone()
    }

    /// Local pipeline counters (receive side).
    #[must_use]
    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// The lazy frame stream.
    ///
    /// Finite while a scan runs; keep calling across scans — the stream
    /// restarts producing as soon as new frames arrive.
    #[must_use]
    pub fn frames(&self) -> FrameStream {
        FrameStream { ring: Arc::clone(&self.ring) }
    }

    /// Persist a frame to disk (delegates to [`crate::save_frame`]).
    pub fn save_frame(
        &self,
        frame: &Frame,
        path: impl AsRef<std::path::Path>,
        format: crate::ImageFormat,
    ) -> Result<(), ClientError> {
        crate::output::save_frame(frame, path, format)
    }

    /// Stop the reception pipeline and drop the sockets.
    pub async fn disconnect(mut self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        tracing::info!("client disconnected");
    }

    /// One command round-trip: encode, send, await the matching response.
    async fn request(
        &mut self,
        id: CommandId,
        payload: &[u8],
    ) -> Result<(ResponseStatus, Vec<u8>), ClientError> {
        self.sequence += 1;
        let wire = encode_command(self.sequence, id, payload, &self.key)
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        self.control.send_to(&wire, self.device).await?;

        let deadline = tokio::time::Instant::now() + self.response_timeout;
        let mut buf = vec![0u8; 65536];
        loop {
            let (len, source) =
                match tokio::time::timeout_at(deadline, self.control.recv_from(&mut buf)).await {
                    Ok(Ok(pair)) => pair,
                    Ok(Err(err)) => return Err(err.into()),
                    Err(_) => return Err(ClientError::Timeout(self.response_timeout)),
                };

            if source.ip() != self.device.ip() {
                continue;
            }

            let response = match decode_response(&buf[..len], &self.key) {
                Ok(response) => response,
                Err(ProtocolError::BadHmac) => return Err(ClientError::Auth),
                Err(err) => {
                    tracing::debug!(error_kind = %err, "ignoring malformed response");
                    continue;
                },
            };

            if response.sequence != self.sequence {
                continue; // stale response from an earlier request
            }

            let status = response
                .status()
                .ok_or_else(|| ClientError::Protocol("unknown response status".to_string()))?;
            return Ok((status, response.payload.to_vec()));
        }
    }

    fn lock_status(&self) -> std::sync::MutexGuard<'_, Option<StatusBody>> {
        self.cached_status.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("device", &self.device)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

/// Map a non-OK response to the right error.
fn expect_ok((status, payload): (ResponseStatus, Vec<u8>)) -> Result<(), ClientError> {
    match status {
        ResponseStatus::Ok => Ok(()),
        ResponseStatus::Busy => Err(ClientError::Busy(ack_detail(&payload))),
        ResponseStatus::Error => Err(ClientError::Rejected(ack_detail(&payload))),
    }
}

fn ack_detail(payload: &[u8]) -> String {
    decode_body::<AckBody>(payload).map(|ack| ack.detail).unwrap_or_default()
}

/// Lazy, pull-based frame sequence backed by the frame ring.
///
/// Callers drive advancement and can stop at any point without draining;
/// whatever they do not pull in time is shed by the ring's oldest-drop
/// discipline.
pub struct FrameStream {
    ring: Arc<FrameRing>,
}

impl FrameStream {
    /// Wait up to `timeout` for the next frame.
    ///
    /// `None` means nothing arrived in time — a normal condition between
    /// scans, not an error.
    pub async fn next_frame(&mut self, timeout: Duration) -> Option<Frame> {
        let slot = self.ring.acquire_send(timeout).await.ok()?;
        let meta = *slot.meta();
        let frame = Frame::from_le_bytes(
            meta.frame_seq,
            meta.timestamp_us,
            meta.width,
            meta.height,
            meta.bit_depth,
            meta.degraded,
            slot.data(),
        );
        slot.release();
        Some(frame)
    }
}

impl std::fmt::Debug for FrameStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameStream").finish_non_exhaustive()
    }
}
