//! # tracklink-protocol
//!
//! Wire protocols spoken by GPS tracking terminals.
//!
//! This crate provides:
//! - GT06 binary framing with CRC-16/X.25 validation
//! - Decoding of login, location, alarm, heartbeat and status messages
//! - Acknowledgment frames for the server side
//! - Protocol detection from the first bytes of a connection

pub mod codec;
pub mod crc;
pub mod error;
pub mod frame;
pub mod gt06;
pub mod message;
pub mod registry;

pub use codec::{AckChecksum, AckKind, Decoded, FrameCodec, PrefixMatch, PrefixOnlyCodec};
pub use crc::crc16_x25;
pub use error::ProtocolError;
pub use frame::{FrameBuilder, RawFrame, MAGIC, MAX_FRAME_SIZE};
pub use gt06::Gt06Codec;
pub use message::{
    AlarmReport, CellTower, DecodedMessage, LocationFix, LoginInfo, MessageKind, Payload,
    StatusReport, TerminalInfo,
};
pub use registry::{Detection, ProtocolRegistry};

/// Default port terminals connect to.
pub const DEFAULT_PORT: u16 = 5023;
