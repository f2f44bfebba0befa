//! Error types and result definitions for the dpsmove crate.
//! Splits failures into the ones that end the device lifecycle and the ones
//! that are logged and contained inside a loop.

use thiserror::Error;

/// Represents all possible errors raised while provisioning, connecting or
/// operating the device.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// A required environment value is missing or malformed
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The provisioning service did not assign the device to a hub
    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    /// Session connect, receive or disconnect failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// A telemetry message could not be sent
    #[error("Send failed: {0}")]
    Send(String),

    /// The acknowledgement for a command could not be sent
    #[error("Responding to the '{command}' command failed: {reason}")]
    SendAck { command: String, reason: String },

    /// JSON serialization or deserialization error
    #[error("JSON error: {0}")]
    Json(String),

    /// A command payload did not carry what the handler needs
    #[error("Invalid command payload: {0}")]
    InvalidPayload(String),

    /// There is no connected session to operate on
    #[error("Device is not connected")]
    NotConnected,

    /// A supervised task panicked or was aborted
    #[error("Task failed: {0}")]
    Task(String),
}

/// A specialized Result type for device operations.
pub type Result<T> = std::result::Result<T, DeviceError>;

impl From<std::io::Error> for DeviceError {
    fn from(err: std::io::Error) -> Self {
        DeviceError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for DeviceError {
    fn from(err: serde_json::Error) -> Self {
        DeviceError::Json(err.to_string())
    }
}

impl DeviceError {
    /// Whether this error must end the device lifecycle.
    ///
    /// Per-tick and per-command failures (sends, acknowledgements, bad
    /// payloads) are contained by the loop that hit them.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DeviceError::Configuration(_)
                | DeviceError::Provisioning(_)
                | DeviceError::Transport(_)
                | DeviceError::Task(_)
        )
    }
}
