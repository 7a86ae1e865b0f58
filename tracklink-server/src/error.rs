//! Server error types.

use crate::queue::QueueError;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] tracklink_protocol::ProtocolError),

    #[error("connection buffer overflow: {size} bytes (max {max})")]
    BufferOverflow { size: usize, max: usize },

    #[error("no protocol matches connection prefix {prefix}")]
    UnknownProtocol { prefix: String },

    #[error("login rejected for device {device_id}")]
    LoginRejected { device_id: String },

    #[error("connection superseded by a newer login")]
    Superseded,

    #[error("downstream unavailable: {0}")]
    DownstreamUnavailable(#[from] QueueError),

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    /// Returns whether the connection must be closed after this error.
    ///
    /// Downstream errors affect one event only; the read loop keeps going.
    pub fn is_connection_fatal(&self) -> bool {
        !matches!(self, ServerError::DownstreamUnavailable(_))
    }

    /// Returns whether the terminal itself misbehaved or the link failed.
    ///
    /// The device is marked `Error` rather than `Offline` when its connection
    /// ends this way.
    pub fn is_device_fault(&self) -> bool {
        matches!(
            self,
            ServerError::Io(_) | ServerError::Protocol(_) | ServerError::BufferOverflow { .. }
        )
    }

    /// Short label, used for metrics and logs.
    pub fn reason(&self) -> &'static str {
        match self {
            ServerError::Io(_) => "io",
            ServerError::Protocol(e) => e.reason(),
            ServerError::BufferOverflow { .. } => "buffer_overflow",
            ServerError::UnknownProtocol { .. } => "unknown_protocol",
            ServerError::LoginRejected { .. } => "login_rejected",
            ServerError::Superseded => "superseded",
            ServerError::DownstreamUnavailable(_) => "downstream_unavailable",
            ServerError::ShuttingDown => "shutting_down",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tracklink_protocol::ProtocolError;

    #[test]
    fn test_fatal_classification() {
        assert!(ServerError::Superseded.is_connection_fatal());
        assert!(ServerError::BufferOverflow { size: 5000, max: 4096 }.is_connection_fatal());
        assert!(ServerError::from(ProtocolError::CrcMismatch {
            expected: 1,
            actual: 2
        })
        .is_connection_fatal());

        assert!(!ServerError::from(QueueError::Timeout(Duration::from_millis(5)))
            .is_connection_fatal());
    }

    #[test]
    fn test_device_fault_classification() {
        assert!(ServerError::from(ProtocolError::InvalidMagic([0, 0])).is_device_fault());
        assert!(ServerError::BufferOverflow { size: 10, max: 8 }.is_device_fault());
        assert!(ServerError::Io(std::io::ErrorKind::ConnectionReset.into()).is_device_fault());

        assert!(!ServerError::Superseded.is_device_fault());
        assert!(!ServerError::ShuttingDown.is_device_fault());
    }

    #[test]
    fn test_reason_labels() {
        assert_eq!(
            ServerError::from(ProtocolError::InvalidMagic([0, 0])).reason(),
            "invalid_magic"
        );
        assert_eq!(
            ServerError::UnknownProtocol {
                prefix: "474554".into()
            }
            .reason(),
            "unknown_protocol"
        );
        assert_eq!(ServerError::from(QueueError::Closed).reason(), "downstream_unavailable");
    }
}
