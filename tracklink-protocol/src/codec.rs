//! The codec contract every terminal protocol implements.

use crate::error::ProtocolError;
use crate::message::DecodedMessage;
use bytes::BytesMut;
use serde::{Deserialize, Serialize};

/// How a byte prefix relates to a codec's start marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixMatch {
    /// The prefix starts with the marker.
    Match,
    /// The prefix is a strict prefix of the marker; more bytes may still match.
    Partial,
    /// The prefix can never match.
    Mismatch,
}

/// Result of a successful decode.
#[derive(Debug, Clone)]
pub struct Decoded {
    pub message: DecodedMessage,
    /// Number of bytes the frame occupied at the front of the buffer.
    pub consumed: usize,
}

/// Acknowledgments the server sends back to terminals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    LoginAccepted,
    LoginRejected,
    Heartbeat,
    Location,
}

/// How the checksum field of outgoing acknowledgments is filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckChecksum {
    /// Same CRC as inbound frame validation.
    #[default]
    Computed,
    /// Zero checksum, for terminals that were deployed against servers that never set it.
    Zeroed,
}

/// A terminal wire protocol.
///
/// Implementations are pure: they look at byte slices and never consume or
/// buffer anything themselves.
pub trait FrameCodec: Send + Sync {
    /// Registry name of the protocol.
    fn name(&self) -> &str;

    /// Leading bytes that identify the protocol on a fresh connection.
    fn marker(&self) -> &[u8];

    /// Checks whether `prefix` belongs to this protocol.
    fn detect(&self, prefix: &[u8]) -> PrefixMatch {
        let marker = self.marker();
        if prefix.len() >= marker.len() {
            if prefix.starts_with(marker) {
                PrefixMatch::Match
            } else {
                PrefixMatch::Mismatch
            }
        } else if marker.starts_with(prefix) {
            PrefixMatch::Partial
        } else {
            PrefixMatch::Mismatch
        }
    }

    /// Decodes the frame at the front of `buf`.
    ///
    /// `Ok(None)` means the frame is incomplete and nothing was consumed.
    fn decode(&self, buf: &[u8]) -> Result<Option<Decoded>, ProtocolError>;

    /// Builds an acknowledgment frame, if the protocol has one for `kind`.
    fn encode_ack(&self, kind: AckKind, serial: u16) -> Option<BytesMut>;
}

/// A protocol recognised by its ASCII prefix but without a frame decoder.
#[derive(Debug, Clone)]
pub struct PrefixOnlyCodec {
    name: String,
    marker: Vec<u8>,
}

impl PrefixOnlyCodec {
    pub fn new(name: impl Into<String>, marker: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            marker: marker.into(),
        }
    }

    /// H02 terminals (`*HQ,<imei>,...#`).
    pub fn h02() -> Self {
        Self::new("h02", b"*HQ,".to_vec())
    }

    /// TK103 / Coban terminals (`##,imei:...`).
    pub fn tk103() -> Self {
        Self::new("tk103", b"##,".to_vec())
    }

    /// Meitrack terminals (`$$<flag><len>,...`).
    pub fn meitrack() -> Self {
        Self::new("meitrack", b"$$".to_vec())
    }
}

impl FrameCodec for PrefixOnlyCodec {
    fn name(&self) -> &str {
        &self.name
    }

    fn marker(&self) -> &[u8] {
        &self.marker
    }

    fn decode(&self, _buf: &[u8]) -> Result<Option<Decoded>, ProtocolError> {
        Err(ProtocolError::UnsupportedProtocol(self.name.clone()))
    }

    fn encode_ack(&self, _kind: AckKind, _serial: u16) -> Option<BytesMut> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_detection() {
        let codec = PrefixOnlyCodec::h02();
        assert_eq!(codec.detect(b"*HQ,8650"), PrefixMatch::Match);
        assert_eq!(codec.detect(b"*HQ,"), PrefixMatch::Match);
        assert_eq!(codec.detect(b"*H"), PrefixMatch::Partial);
        assert_eq!(codec.detect(b""), PrefixMatch::Partial);
        assert_eq!(codec.detect(b"*X"), PrefixMatch::Mismatch);
        assert_eq!(codec.detect(b"##,imei"), PrefixMatch::Mismatch);
    }

    #[test]
    fn test_prefix_only_codec_refuses_decode() {
        let codec = PrefixOnlyCodec::tk103();
        let result = codec.decode(b"##,imei:359586015829802,A;");
        assert!(matches!(result, Err(ProtocolError::UnsupportedProtocol(name)) if name == "tk103"));
        assert!(codec.encode_ack(AckKind::Heartbeat, 1).is_none());
    }

    #[test]
    fn test_ack_checksum_default() {
        assert_eq!(AckChecksum::default(), AckChecksum::Computed);
        assert_eq!(
            serde_json::from_str::<AckChecksum>("\"zeroed\"").unwrap(),
            AckChecksum::Zeroed
        );
    }
}
