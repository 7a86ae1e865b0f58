//! # tracklink-core
//!
//! Shared device state for tracklink.
//!
//! This crate provides:
//! - Device sessions keyed by hardware identity
//! - Connection handles that let one connection close another
//! - The concurrent device registry shared by all connections

pub mod error;
pub mod registry;
pub mod session;

pub use error::CoreError;
pub use registry::DeviceRegistry;
pub use session::{ConnectionHandle, DeviceSession, DeviceStatus};
