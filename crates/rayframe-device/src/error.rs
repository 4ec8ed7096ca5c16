//! Device daemon error types.

use rayframe_core::ConfigError;
use thiserror::Error;

/// Errors surfaced by the device runtime.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Configuration load or validation failure (startup exit code 1)
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Missing or undecodable pre-shared key
    #[error("key error: {0}")]
    Key(String),

    /// Socket setup or send/receive failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Register bus access failure
    #[error("register bus error: {0}")]
    Register(String),

    /// Capture source failure
    #[error("capture error: {0}")]
    Capture(String),
}

impl From<std::io::Error> for DeviceError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
