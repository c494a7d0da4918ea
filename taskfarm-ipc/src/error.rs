//! IPC error types

use thiserror::Error;

/// Transport and protocol errors
#[derive(Debug, Error)]
pub enum IpcError {
    /// Value could not be encoded for the wire
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Frame could not be decoded
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// Underlying pipe or channel failure
    #[error("i/o failure: {0}")]
    Io(String),

    /// The peer went away (process exited, pipe broken, channel dropped)
    #[error("channel closed")]
    ChannelClosed,

    /// Peer speaks a different protocol version
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    /// No reply arrived within the configured deadline
    #[error("timed out waiting for reply")]
    Timeout,
}

impl IpcError {
    /// Infrastructure faults that the farm's retry policy may recover from
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IpcError::Io(_) | IpcError::Timeout | IpcError::ChannelClosed
        )
    }

    /// Faults that indicate a broken peer rather than a transient condition
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IpcError::VersionMismatch { .. } | IpcError::Deserialization(_)
        )
    }
}

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        IpcError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for IpcError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            IpcError::Io(err.to_string())
        } else if err.is_data() {
            IpcError::Deserialization(err.to_string())
        } else {
            IpcError::Serialization(err.to_string())
        }
    }
}
