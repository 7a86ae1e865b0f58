//! # tracklink-client
//!
//! Simulated tracking terminal for tracklink.
//!
//! This crate provides:
//! - Async TCP terminal that speaks the GT06 device side
//! - Login, location, alarm, heartbeat and status messages
//! - Acknowledgment parsing, including zero-checksum acks

pub mod ack;
pub mod error;
pub mod terminal;

pub use ack::Ack;
pub use error::ClientError;
pub use terminal::{Terminal, TerminalConfig};
