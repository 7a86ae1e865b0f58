//! GT06 binary frame format.
//!
//! Frame layout (short form, 1-byte length):
//!
//! ```text
//! +-------+--------+------+--------------+--------+-------+-------+
//! | start | length | type | information  | serial |  crc  | stop  |
//! | 78 78 | 1 byte |  1   | length-5     |   2    |   2   | 0D 0A |
//! +-------+--------+------+--------------+--------+-------+-------+
//! ```
//!
//! `length` counts the bytes from `type` through `crc`, so a whole frame is
//! `length + 5` bytes. The CRC covers `length` through `serial`.

use crate::crc::crc16_x25;
use crate::error::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};

/// Start marker of a short GT06 frame.
pub const MAGIC: [u8; 2] = [0x78, 0x78];

/// Stop marker closing every frame.
pub const STOP: [u8; 2] = [0x0D, 0x0A];

/// Bytes needed before the length field can be read (start + length + type).
pub const FRAME_PREFIX_SIZE: usize = 4;

/// Bytes outside the `length`-counted span (start, length byte, stop).
pub const FRAME_OVERHEAD: usize = 5;

/// Smallest legal length value: type + serial + crc with an empty body.
pub const MIN_LENGTH: u8 = 5;

/// Largest possible frame with a 1-byte length field.
pub const MAX_FRAME_SIZE: usize = u8::MAX as usize + FRAME_OVERHEAD;

/// A checksum-validated frame before its body is interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Protocol number (message type code).
    pub type_code: u8,
    /// Information content between the type byte and the serial number.
    pub info: Bytes,
    /// Information serial number, echoed back in acknowledgments.
    pub serial: u16,
}

impl RawFrame {
    /// Total wire size for a frame declaring `length`.
    pub fn wire_len(length: u8) -> usize {
        length as usize + FRAME_OVERHEAD
    }

    /// Reads the frame at the front of `buf` without consuming anything.
    ///
    /// Returns `Ok(Some((frame, consumed)))` for a complete valid frame,
    /// `Ok(None)` when more bytes are needed, and `Err` when the bytes at the
    /// front of the buffer cannot be a valid frame.
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>, ProtocolError> {
        if buf.len() >= 2 && buf[..2] != MAGIC {
            return Err(ProtocolError::InvalidMagic([buf[0], buf[1]]));
        }
        if buf.len() < FRAME_PREFIX_SIZE {
            return Ok(None);
        }

        let length = buf[2];
        if length < MIN_LENGTH {
            return Err(ProtocolError::CorruptFrame {
                reason: format!("length field {} below minimum {}", length, MIN_LENGTH),
            });
        }

        let total = Self::wire_len(length);
        if buf.len() < total {
            return Ok(None);
        }

        let frame = &buf[..total];
        if frame[total - 2..] != STOP {
            return Err(ProtocolError::CorruptFrame {
                reason: format!(
                    "missing stop marker, got {:02x} {:02x}",
                    frame[total - 2],
                    frame[total - 1]
                ),
            });
        }

        // CRC sits right before the stop marker and covers length..=serial.
        let crc_at = total - 4;
        let expected = u16::from_be_bytes([frame[crc_at], frame[crc_at + 1]]);
        let actual = crc16_x25(&frame[2..crc_at]);
        if expected != actual {
            return Err(ProtocolError::CrcMismatch { expected, actual });
        }

        let serial_at = crc_at - 2;
        let serial = u16::from_be_bytes([frame[serial_at], frame[serial_at + 1]]);
        let info = Bytes::copy_from_slice(&frame[FRAME_PREFIX_SIZE..serial_at]);

        Ok(Some((
            Self {
                type_code: frame[3],
                info,
                serial,
            },
            total,
        )))
    }
}

/// Builds well-formed frames with a correct checksum.
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    type_code: u8,
    info: BytesMut,
    serial: u16,
}

impl FrameBuilder {
    pub fn new(type_code: u8) -> Self {
        Self {
            type_code,
            info: BytesMut::new(),
            serial: 0,
        }
    }

    pub fn info(mut self, info: &[u8]) -> Self {
        self.info.extend_from_slice(info);
        self
    }

    pub fn serial(mut self, serial: u16) -> Self {
        self.serial = serial;
        self
    }

    /// Encodes the frame.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let length = self.info.len() + MIN_LENGTH as usize;
        if length > u8::MAX as usize {
            return Err(ProtocolError::FrameTooLarge {
                size: length + FRAME_OVERHEAD,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(length + FRAME_OVERHEAD);
        buf.put_slice(&MAGIC);
        buf.put_u8(length as u8);
        buf.put_u8(self.type_code);
        buf.put_slice(&self.info);
        buf.put_u16(self.serial);
        let crc = crc16_x25(&buf[2..]);
        buf.put_u16(crc);
        buf.put_slice(&STOP);
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_parse_roundtrip() {
        let encoded = FrameBuilder::new(0x13)
            .info(&[0x40, 0x04, 0x04, 0x00, 0x01])
            .serial(0x0007)
            .encode()
            .unwrap();
        assert_eq!(encoded.len(), encoded[2] as usize + FRAME_OVERHEAD);

        let (frame, consumed) = RawFrame::parse(&encoded).unwrap().unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(frame.type_code, 0x13);
        assert_eq!(frame.serial, 7);
        assert_eq!(frame.info.as_ref(), &[0x40, 0x04, 0x04, 0x00, 0x01]);
    }

    #[test]
    fn test_known_wire_bytes() {
        let encoded = FrameBuilder::new(0x01).serial(1).encode().unwrap();
        assert_eq!(
            encoded.as_ref(),
            &[0x78, 0x78, 0x05, 0x01, 0x00, 0x01, 0xD9, 0xDC, 0x0D, 0x0A]
        );
    }

    #[test]
    fn test_incomplete_prefix() {
        assert!(RawFrame::parse(&[]).unwrap().is_none());
        assert!(RawFrame::parse(&[0x78]).unwrap().is_none());
        assert!(RawFrame::parse(&[0x78, 0x78, 0x05]).unwrap().is_none());
        assert!(RawFrame::parse(&[0x78, 0x78, 0x05, 0x01, 0x00])
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_invalid_magic() {
        let result = RawFrame::parse(&[0x79, 0x79, 0x00]);
        assert!(matches!(result, Err(ProtocolError::InvalidMagic([0x79, 0x79]))));
    }

    #[test]
    fn test_length_below_minimum() {
        let result = RawFrame::parse(&[0x78, 0x78, 0x02, 0x01, 0x00, 0x00, 0x0D]);
        assert!(matches!(result, Err(ProtocolError::CorruptFrame { .. })));
    }

    #[test]
    fn test_bad_stop_marker() {
        let mut encoded = FrameBuilder::new(0x01).serial(1).encode().unwrap();
        let len = encoded.len();
        encoded[len - 1] = 0x00;
        let result = RawFrame::parse(&encoded);
        assert!(matches!(result, Err(ProtocolError::CorruptFrame { .. })));
    }

    #[test]
    fn test_crc_validation() {
        let mut encoded = FrameBuilder::new(0x13)
            .info(&[0x01, 0x02, 0x03])
            .serial(9)
            .encode()
            .unwrap();
        encoded[5] ^= 0x10;
        let result = RawFrame::parse(&encoded);
        assert!(matches!(result, Err(ProtocolError::CrcMismatch { .. })));
    }

    #[test]
    fn test_trailing_bytes_not_consumed() {
        let mut buf = BytesMut::new();
        let first = FrameBuilder::new(0x13).serial(1).encode().unwrap();
        buf.extend_from_slice(&first);
        buf.extend_from_slice(&[0x78, 0x78, 0x0A]);

        let (_, consumed) = RawFrame::parse(&buf).unwrap().unwrap();
        assert_eq!(consumed, first.len());
    }

    #[test]
    fn test_frame_too_large() {
        let info = vec![0u8; 251];
        let result = FrameBuilder::new(0x12).info(&info).encode();
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));

        let info = vec![0u8; 250];
        let encoded = FrameBuilder::new(0x12).info(&info).encode().unwrap();
        assert_eq!(encoded.len(), MAX_FRAME_SIZE);
    }

    #[test]
    fn test_shrunken_length_is_corrupt_or_incomplete() {
        let mut encoded = FrameBuilder::new(0x12)
            .info(&[0u8; 20])
            .serial(3)
            .encode()
            .unwrap();
        encoded[2] -= 4;
        // The stop marker is now expected inside the body.
        assert!(RawFrame::parse(&encoded).is_err());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        fn frame_strategy() -> impl Strategy<Value = BytesMut> {
            (
                any::<u8>(),
                proptest::collection::vec(any::<u8>(), 0..250),
                any::<u16>(),
            )
                .prop_map(|(type_code, info, serial)| {
                    FrameBuilder::new(type_code)
                        .info(&info)
                        .serial(serial)
                        .encode()
                        .unwrap()
                })
        }

        proptest! {
            #[test]
            fn valid_frame_consumes_length_plus_five(frame in frame_strategy()) {
                let (_, consumed) = RawFrame::parse(&frame).unwrap().unwrap();
                prop_assert_eq!(consumed, frame[2] as usize + FRAME_OVERHEAD);
                prop_assert_eq!(consumed, frame.len());
            }

            #[test]
            fn strict_prefix_is_incomplete(frame in frame_strategy(), cut in any::<prop::sample::Index>()) {
                let cut = cut.index(frame.len());
                prop_assert!(RawFrame::parse(&frame[..cut]).unwrap().is_none());
            }

            #[test]
            fn flipped_bit_fails_crc(
                frame in frame_strategy(),
                at in any::<prop::sample::Index>(),
                bit in 0u8..8,
            ) {
                let mut frame = frame;
                let crc_at = frame.len() - 4;
                let at = 3 + at.index(crc_at - 3);
                frame[at] ^= 1 << bit;
                let is_crc_mismatch = matches!(
                    RawFrame::parse(&frame),
                    Err(ProtocolError::CrcMismatch { .. })
                );
                prop_assert!(is_crc_mismatch);
            }
        }
    }
}
