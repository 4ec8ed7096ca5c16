//! Host SDK error types.

use thiserror::Error;

/// Errors surfaced by the client.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Socket setup or I/O failure
    #[error("io error: {0}")]
    Io(String),

    /// No response from the device within the deadline
    #[error("device did not respond within {0:?}")]
    Timeout(std::time::Duration),

    /// A response failed HMAC verification — wrong key or an impostor
    #[error("response failed authentication")]
    Auth,

    /// The device answered ERROR
    #[error("device rejected the command: {0}")]
    Rejected(String),

    /// The device answered BUSY
    #[error("device is busy: {0}")]
    Busy(String),

    /// Wire-format failure on the control path
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Frame output failure
    #[error("output error: {0}")]
    Output(String),
}

impl ClientError {
    /// Returns true if this error is transient and may succeed on retry.
    ///
    /// Transient errors are lost datagrams and socket hiccups. Deliberate
    /// device answers (BUSY, ERROR) and authentication failures are never
    /// transient — repeating the command unchanged cannot fix them.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Io(_))
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
