//! Protocol error types.

use thiserror::Error;

/// Errors produced while detecting or decoding terminal frames.
///
/// An incomplete frame is not an error: decoders report it as `Ok(None)`.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid start marker: expected 0x7878, got {0:02x?}")]
    InvalidMagic([u8; 2]),

    #[error("corrupt frame: {reason}")]
    CorruptFrame { reason: String },

    #[error("CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    CrcMismatch { expected: u16, actual: u16 },

    #[error("invalid field '{field}' in {frame_len}-byte frame: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
        frame_len: usize,
    },

    #[error("no registered protocol matches prefix {0:02x?}")]
    UnknownProtocol(Vec<u8>),

    #[error("protocol '{0}' is detected but has no frame decoder")]
    UnsupportedProtocol(String),

    #[error("invalid device id '{0}': expected 16 hex characters")]
    InvalidDeviceId(String),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
}

impl ProtocolError {
    /// Returns whether the error means the byte stream offset can no longer be trusted.
    ///
    /// Field errors are raised only after the frame passed its checksum, so the
    /// caller may skip exactly that frame and keep reading.
    pub fn is_stream_corrupt(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidMagic(_)
                | ProtocolError::CorruptFrame { .. }
                | ProtocolError::CrcMismatch { .. }
        )
    }

    /// Returns the length of a checksum-valid frame that failed field decoding.
    pub fn skippable_len(&self) -> Option<usize> {
        match self {
            ProtocolError::InvalidField { frame_len, .. } => Some(*frame_len),
            _ => None,
        }
    }

    /// Short machine-readable label, used for metrics and logs.
    pub fn reason(&self) -> &'static str {
        match self {
            ProtocolError::InvalidMagic(_) => "invalid_magic",
            ProtocolError::CorruptFrame { .. } => "corrupt_frame",
            ProtocolError::CrcMismatch { .. } => "crc_mismatch",
            ProtocolError::InvalidField { .. } => "invalid_field",
            ProtocolError::UnknownProtocol(_) => "unknown_protocol",
            ProtocolError::UnsupportedProtocol(_) => "unsupported_protocol",
            ProtocolError::InvalidDeviceId(_) => "invalid_device_id",
            ProtocolError::FrameTooLarge { .. } => "frame_too_large",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_corrupt_classification() {
        assert!(ProtocolError::InvalidMagic([0x00, 0x01]).is_stream_corrupt());
        assert!(ProtocolError::CrcMismatch {
            expected: 1,
            actual: 2
        }
        .is_stream_corrupt());
        assert!(ProtocolError::CorruptFrame {
            reason: "bad stop".into()
        }
        .is_stream_corrupt());

        let field = ProtocolError::InvalidField {
            field: "latitude",
            reason: "short body".into(),
            frame_len: 20,
        };
        assert!(!field.is_stream_corrupt());
        assert_eq!(field.skippable_len(), Some(20));
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::CrcMismatch {
            expected: 0xABCD,
            actual: 0x1234,
        };
        let msg = err.to_string();
        assert!(msg.contains("0xabcd"));
        assert!(msg.contains("0x1234"));

        let err = ProtocolError::UnsupportedProtocol("h02".into());
        assert!(err.to_string().contains("h02"));

        let err = ProtocolError::FrameTooLarge { size: 300, max: 260 };
        assert!(err.to_string().contains("300"));

        let err = ProtocolError::InvalidMagic([0x24, 0x24]);
        assert!(err.to_string().contains("24"));
    }

    #[test]
    fn test_reason_labels() {
        assert_eq!(
            ProtocolError::UnknownProtocol(vec![1]).reason(),
            "unknown_protocol"
        );
        assert_eq!(
            ProtocolError::CrcMismatch {
                expected: 0,
                actual: 1
            }
            .reason(),
            "crc_mismatch"
        );
    }
}
