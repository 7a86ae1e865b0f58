//! Server acknowledgment frames as seen by a terminal.

use tracklink_protocol::frame::{FRAME_OVERHEAD, MIN_LENGTH, STOP};
use tracklink_protocol::{crc16_x25, ProtocolError, MAGIC};

/// Wire size of every acknowledgment frame.
pub const ACK_LEN: usize = MIN_LENGTH as usize + FRAME_OVERHEAD;

/// A parsed acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// Type code being acknowledged (`0x81` for a rejected login).
    pub type_code: u8,
    /// Serial number echoed from the acknowledged frame.
    pub serial: u16,
    /// Whether the server left the checksum field zeroed.
    pub zero_checksum: bool,
}

impl Ack {
    /// Parses the acknowledgment at the front of `buf`.
    ///
    /// Returns `Ok(None)` until all ten bytes are present. A zero checksum is
    /// accepted; any other value must match.
    pub fn parse(buf: &[u8]) -> Result<Option<Ack>, ProtocolError> {
        if buf.len() >= 2 && buf[..2] != MAGIC {
            return Err(ProtocolError::InvalidMagic([buf[0], buf[1]]));
        }
        if buf.len() < ACK_LEN {
            return Ok(None);
        }

        let frame = &buf[..ACK_LEN];
        if frame[2] != MIN_LENGTH {
            return Err(ProtocolError::CorruptFrame {
                reason: format!("ack length field {} (expected {})", frame[2], MIN_LENGTH),
            });
        }
        if frame[8..] != STOP {
            return Err(ProtocolError::CorruptFrame {
                reason: "missing stop marker".to_string(),
            });
        }

        let crc = u16::from_be_bytes([frame[6], frame[7]]);
        if crc != 0 {
            let actual = crc16_x25(&frame[2..6]);
            if crc != actual {
                return Err(ProtocolError::CrcMismatch {
                    expected: crc,
                    actual,
                });
            }
        }

        Ok(Some(Ack {
            type_code: frame[3],
            serial: u16::from_be_bytes([frame[4], frame[5]]),
            zero_checksum: crc == 0,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracklink_protocol::gt06;
    use tracklink_protocol::{AckChecksum, AckKind};

    #[test]
    fn test_login_ack() {
        let bytes = [0x78, 0x78, 0x05, 0x01, 0x00, 0x01, 0xD9, 0xDC, 0x0D, 0x0A];
        let ack = Ack::parse(&bytes).unwrap().unwrap();
        assert_eq!(ack.type_code, 0x01);
        assert_eq!(ack.serial, 1);
        assert!(!ack.zero_checksum);
    }

    #[test]
    fn test_zeroed_checksum_accepted() {
        let bytes = gt06::encode_ack(AckKind::Heartbeat, 0x0203, AckChecksum::Zeroed);
        let ack = Ack::parse(&bytes).unwrap().unwrap();
        assert_eq!(ack.type_code, 0x13);
        assert_eq!(ack.serial, 0x0203);
        assert!(ack.zero_checksum);
    }

    #[test]
    fn test_bad_checksum_rejected() {
        let mut bytes = gt06::encode_ack(AckKind::Location, 7, AckChecksum::Computed).to_vec();
        bytes[7] ^= 0x01;
        assert!(matches!(
            Ack::parse(&bytes),
            Err(ProtocolError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_partial_and_garbage() {
        let bytes = gt06::encode_ack(AckKind::LoginRejected, 1, AckChecksum::Computed);
        assert_eq!(Ack::parse(&bytes[..9]).unwrap(), None);
        assert_eq!(Ack::parse(&bytes).unwrap().unwrap().type_code, 0x81);
        assert!(matches!(
            Ack::parse(b"HTTP/1.1 400"),
            Err(ProtocolError::InvalidMagic(_))
        ));
    }
}
