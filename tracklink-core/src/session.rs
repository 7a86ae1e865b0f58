//! Device session state.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

/// Device connectivity status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    #[default]
    Online,
    Offline,
    Error,
}

#[derive(Debug, Default)]
struct CloseSignal {
    closed: AtomicBool,
    notify: Notify,
}

/// Handle to the socket a device session is bound to.
///
/// Clones share the same close signal. Closing is idempotent; the owning
/// connection task observes it through [`ConnectionHandle::closed`].
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionHandle {
    id: Uuid,
    remote_addr: SocketAddr,
    #[serde(skip)]
    signal: Arc<CloseSignal>,
}

impl ConnectionHandle {
    pub fn new(remote_addr: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_addr,
            signal: Arc::new(CloseSignal::default()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Asks the owning connection to close.
    pub fn close(&self) {
        if !self.signal.closed.swap(true, Ordering::AcqRel) {
            self.signal.notify.notify_one();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.signal.closed.load(Ordering::Acquire)
    }

    /// Completes once [`close`](Self::close) has been called on any clone.
    pub async fn closed(&self) {
        if self.is_closed() {
            return;
        }
        self.signal.notify.notified().await;
    }
}

/// One terminal's live connection state.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSession {
    /// Hardware identity, stable across reconnects.
    pub device_id: String,
    pub connection: ConnectionHandle,
    /// Protocol the connection was pinned to.
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_code: Option<u16>,
    pub connected_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub status: DeviceStatus,
    /// Key/value fields merged from STATUS reports.
    pub metadata: Map<String, Value>,
}

impl DeviceSession {
    /// Creates an online session bound to `connection`.
    pub fn new(
        device_id: impl Into<String>,
        connection: ConnectionHandle,
        protocol: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            connection,
            protocol: protocol.into(),
            model_code: None,
            connected_at: Utc::now(),
            last_heartbeat: None,
            status: DeviceStatus::Online,
            metadata: Map::new(),
        }
    }

    pub fn with_model_code(mut self, model_code: Option<u16>) -> Self {
        self.model_code = model_code;
        self
    }
}
