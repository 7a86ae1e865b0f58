//! # tracklink-server
//!
//! TCP ingestion server for tracklink.
//!
//! This crate provides:
//! - TCP connection handling with async I/O
//! - Per-connection stream reassembly and protocol pinning
//! - Message dispatch with acknowledgments
//! - Forwarding of location and alarm events to a job queue
//! - Prometheus metrics

pub mod config;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod queue;
pub mod server;
pub mod session;

pub use config::{
    Config, CorruptFramePolicy, DevicesConfig, ForwardingConfig, MetricsConfig, NetworkConfig,
    ProtocolConfig,
};
pub use error::ServerError;
pub use handler::{ForwardingLimits, MessageHandler};
pub use metrics::Metrics;
pub use queue::{ChannelQueue, Job, JobKind, JobQueue, QueueError};
pub use server::{Server, ServerConfig, ServerStats};
pub use session::{ConnectionSession, SessionEvent, SessionLimits, SessionState};
