//! Device registry - live sessions keyed by device identity.

use crate::error::CoreError;
use crate::session::{DeviceSession, DeviceStatus};
use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Map, Value};
use uuid::Uuid;

/// Concurrent table of device sessions shared by all connections.
///
/// Holds at most one session per identity. Mutations on unknown identities
/// are no-ops that return `false`.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    sessions: DashMap<String, DeviceSession>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session, returning the entry it replaced.
    ///
    /// The caller owns closing the replaced connection; it may be the same
    /// connection when a terminal logs in twice.
    pub fn register(&self, session: DeviceSession) -> Option<DeviceSession> {
        let previous = self.sessions.insert(session.device_id.clone(), session);
        if let Some(prev) = &previous {
            tracing::debug!(
                "Device {} re-registered, previous connection {} from {}",
                prev.device_id,
                prev.connection.id(),
                prev.connection.remote_addr()
            );
        }
        previous
    }

    /// Removes a device regardless of which connection owns it.
    pub fn unregister(&self, device_id: &str) -> Option<DeviceSession> {
        self.sessions.remove(device_id).map(|(_, session)| session)
    }

    /// Removes a device only if its entry still belongs to `connection_id`.
    ///
    /// A connection that was superseded by a newer login must not remove
    /// the newer entry when it closes.
    pub fn unregister_connection(&self, device_id: &str, connection_id: Uuid) -> bool {
        self.sessions
            .remove_if(device_id, |_, session| {
                session.connection.id() == connection_id
            })
            .is_some()
    }

    /// Refreshes the heartbeat timestamp.
    pub fn touch_heartbeat(&self, device_id: &str) -> bool {
        match self.sessions.get_mut(device_id) {
            Some(mut session) => {
                session.last_heartbeat = Some(Utc::now());
                true
            }
            None => false,
        }
    }

    /// Merges key/value fields into the device metadata, overwriting existing keys.
    pub fn merge_status(&self, device_id: &str, fields: Map<String, Value>) -> bool {
        match self.sessions.get_mut(device_id) {
            Some(mut session) => {
                session.metadata.extend(fields);
                true
            }
            None => false,
        }
    }

    /// Sets the lifecycle status, only if the entry still belongs to `connection_id`.
    pub fn set_status(&self, device_id: &str, connection_id: Uuid, status: DeviceStatus) -> bool {
        match self.sessions.get_mut(device_id) {
            Some(mut session) if session.connection.id() == connection_id => {
                session.status = status;
                true
            }
            _ => false,
        }
    }

    /// Returns a snapshot of one session.
    pub fn get(&self, device_id: &str) -> Option<DeviceSession> {
        self.sessions.get(device_id).map(|s| s.value().clone())
    }

    /// Like [`get`](Self::get), but unknown identities are an error.
    pub fn session(&self, device_id: &str) -> Result<DeviceSession, CoreError> {
        self.get(device_id).ok_or_else(|| CoreError::DeviceNotFound {
            device_id: device_id.to_string(),
        })
    }

    /// Returns a snapshot of all sessions.
    pub fn all(&self) -> Vec<DeviceSession> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Number of sessions currently marked online.
    pub fn online_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.status == DeviceStatus::Online)
            .count()
    }
}
