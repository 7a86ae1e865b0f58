//! Client error types.

use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] tracklink_protocol::ProtocolError),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timed out waiting for the server")]
    Timeout,

    #[error("unexpected ack type {actual:#04x} (expected {expected:#04x})")]
    UnexpectedAck { expected: u8, actual: u8 },

    #[error("login rejected for device {device_id}")]
    LoginRejected { device_id: String },
}

impl ClientError {
    /// Returns whether reconnecting and retrying may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_) | ClientError::ConnectionClosed | ClientError::Timeout
        )
    }
}
