//! Authenticated control plane.
//!
//! One driver instance handles every control datagram: verify the HMAC,
//! enforce per-source sequence monotonicity (replay protection), dispatch by
//! command id and build the response. Pure logic — the runtime executes the
//! returned actions (sending responses, forwarding scan requests to the FSM
//! task).
//!
//! GET_STATUS answers from the cached status snapshot and the atomic
//! counters only; it never performs a device round-trip, which is what keeps
//! the response deadline comfortably under 50 ms.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use rayframe_core::{DetectorConfig, KeyClass, RingCounters, config};
use rayframe_proto::{
    CommandFrame, CommandId, HmacKey, ProtocolError, ResponseStatus, decode_command,
    encode_response,
    payloads::{
        AckBody, HealthFlags, ScanMode, ScanPhase, SetConfig, StartScan, StatusBody, encode_body,
    },
};

/// Scan requests forwarded to the FSM task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanRequest {
    /// Begin a scan
    Start {
        /// Acquisition mode
        mode: ScanMode,
        /// Gain/calibration tier
        tier: u8,
    },
    /// Stop the active scan
    Stop,
    /// Return to idle and reinitialize
    Reset,
}

/// Status snapshot the runtime keeps current for the control plane.
#[derive(Debug, Clone, Default)]
pub struct CachedStatus {
    /// Current FSM phase
    pub phase: ScanPhase,
    /// Mode of the active scan
    pub active_mode: Option<ScanMode>,
    /// Health flags
    pub health: HealthFlags,
}

/// Actions the control driver produces.
#[derive(Debug, Clone)]
pub enum ControlAction {
    /// Send an encoded response datagram
    Respond {
        /// Destination (the command's source)
        dest: SocketAddr,
        /// Encoded response frame
        bytes: Bytes,
    },
    /// Hand a scan request to the FSM task
    Forward(ScanRequest),
    /// A configuration key changed; the runtime propagates hot effects
    ConfigChanged {
        /// Key that changed
        key: String,
        /// Its classification
        class: KeyClass,
    },
}

/// The control-plane driver.
pub struct ControlDriver {
    key: HmacKey,
    /// Highest accepted sequence per source address.
    last_seq: HashMap<SocketAddr, u32>,
    counters: Arc<RingCounters>,
}

impl ControlDriver {
    /// New driver with the pre-shared key.
    #[must_use]
    pub fn new(key: HmacKey, counters: Arc<RingCounters>) -> Self {
        Self { key, last_seq: HashMap::new(), counters }
    }

    /// Handle one control datagram.
    ///
    /// Authentication and replay rejects return no actions (nothing goes
    /// back to an unauthenticated peer); accepted commands always produce a
    /// response plus whatever side effects they imply.
    pub fn process_datagram(
        &mut self,
        datagram: &[u8],
        source: SocketAddr,
        status: &CachedStatus,
        config: &mut DetectorConfig,
    ) -> Vec<ControlAction> {
        let cmd = match decode_command(datagram, &self.key) {
            Ok(cmd) => cmd,
            Err(ProtocolError::BadHmac) => {
                self.counters.incr_auth_failures();
                tracing::warn!(%source, error_kind = "bad_hmac", "rejecting control datagram");
                return Vec::new();
            },
            Err(err) => {
                // Garbage (bad magic, truncation): not worth a WARN.
                self.counters.incr_auth_failures();
                tracing::debug!(%source, error_kind = %err, "discarding control datagram");
                return Vec::new();
            },
        };

        if !self.accept_sequence(source, cmd.sequence) {
            self.counters.incr_auth_failures();
            tracing::warn!(
                %source,
                sequence = cmd.sequence,
                error_kind = "replay_sequence",
                "rejecting replayed or stale control sequence"
            );
            return Vec::new();
        }

        self.dispatch(&cmd, source, status, config)
    }

    /// `true` if `sequence` is strictly newer than anything accepted from
    /// `source`; records it when so.
    fn accept_sequence(&mut self, source: SocketAddr, sequence: u32) -> bool {
        match self.last_seq.get(&source) {
            Some(&last) if sequence <= last => false,
            _ => {
                self.last_seq.insert(source, sequence);
                true
            },
        }
    }

    fn dispatch(
        &self,
        cmd: &CommandFrame,
        source: SocketAddr,
        status: &CachedStatus,
        config: &mut DetectorConfig,
    ) -> Vec<ControlAction> {
        match cmd.command() {
            Some(CommandId::StartScan) => self.handle_start(cmd, source, status),
            Some(CommandId::StopScan) => {
                let mut actions = vec![ControlAction::Forward(ScanRequest::Stop)];
                actions.extend(self.ack(cmd, source, ResponseStatus::Ok, &AckBody::ok()));
                actions
            },
            Some(CommandId::GetStatus) => self.handle_get_status(cmd, source, status),
            Some(CommandId::SetConfig) => self.handle_set_config(cmd, source, status, config),
            Some(CommandId::Reset) => {
                let mut actions = vec![ControlAction::Forward(ScanRequest::Reset)];
                actions.extend(self.ack(cmd, source, ResponseStatus::Ok, &AckBody::ok()));
                actions
            },
            None => {
                tracing::warn!(command_id = cmd.command_id, "unknown command id");
                self.ack(
                    cmd,
                    source,
                    ResponseStatus::Error,
                    &AckBody::with_detail(format!("unknown command {:#06x}", cmd.command_id)),
                )
            },
        }
    }

    fn handle_start(
        &self,
        cmd: &CommandFrame,
        source: SocketAddr,
        status: &CachedStatus,
    ) -> Vec<ControlAction> {
        let body: StartScan = match rayframe_proto::payloads::decode_body(&cmd.payload) {
            Ok(body) => body,
            Err(err) => {
                return self.ack(
                    cmd,
                    source,
                    ResponseStatus::Error,
                    &AckBody::with_detail(format!("bad start_scan payload: {err}")),
                );
            },
        };

        if status.phase != ScanPhase::Idle {
            return self.ack(
                cmd,
                source,
                ResponseStatus::Busy,
                &AckBody::with_detail(format!("scan already active ({:?})", status.phase)),
            );
        }

        let mut actions =
            vec![ControlAction::Forward(ScanRequest::Start { mode: body.mode, tier: body.tier })];
        actions.extend(self.ack(cmd, source, ResponseStatus::Ok, &AckBody::ok()));
        actions
    }

    fn handle_get_status(
        &self,
        cmd: &CommandFrame,
        source: SocketAddr,
        status: &CachedStatus,
    ) -> Vec<ControlAction> {
        let body = StatusBody {
            phase: status.phase,
            active_mode: status.active_mode,
            counters: self.counters.snapshot(),
            health: status.health.clone(),
        };
        self.ack(cmd, source, ResponseStatus::Ok, &body)
    }

    fn handle_set_config(
        &self,
        cmd: &CommandFrame,
        source: SocketAddr,
        status: &CachedStatus,
        config: &mut DetectorConfig,
    ) -> Vec<ControlAction> {
        let body: SetConfig = match rayframe_proto::payloads::decode_body(&cmd.payload) {
            Ok(body) => body,
            Err(err) => {
                return self.ack(
                    cmd,
                    source,
                    ResponseStatus::Error,
                    &AckBody::with_detail(format!("bad set_config payload: {err}")),
                );
            },
        };

        let Some(class) = config::classify(&body.key) else {
            return self.ack(
                cmd,
                source,
                ResponseStatus::Error,
                &AckBody::with_detail(format!("unknown config key '{}'", body.key)),
            );
        };

        if class == KeyClass::Cold && status.phase != ScanPhase::Idle {
            return self.ack(
                cmd,
                source,
                ResponseStatus::Busy,
                &AckBody::with_detail(format!("'{}' is cold, stop the scan first", body.key)),
            );
        }

        match config.apply_kv(&body.key, &body.value) {
            Ok(class) => {
                tracing::info!(key = %body.key, value = %body.value, "configuration updated");
                let mut actions =
                    vec![ControlAction::ConfigChanged { key: body.key.clone(), class }];
                actions.extend(self.ack(cmd, source, ResponseStatus::Ok, &AckBody::ok()));
                actions
            },
            Err(err) => self.ack(
                cmd,
                source,
                ResponseStatus::Error,
                &AckBody::with_detail(err.to_string()),
            ),
        }
    }

    /// Encode a response, echoing the command's sequence.
    fn ack<T: serde::Serialize>(
        &self,
        cmd: &CommandFrame,
        dest: SocketAddr,
        response_status: ResponseStatus,
        body: &T,
    ) -> Vec<ControlAction> {
        let payload = match encode_body(body) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(error_kind = %err, "failed to encode response body");
                return Vec::new();
            },
        };

        match encode_response(cmd.sequence, response_status, &payload, &self.key) {
            Ok(bytes) => vec![ControlAction::Respond { dest, bytes }],
            Err(err) => {
                tracing::error!(error_kind = %err, "failed to encode response frame");
                Vec::new()
            },
        }
    }
}

impl std::fmt::Debug for ControlDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlDriver").field("known_sources", &self.last_seq.len()).finish()
    }
}
