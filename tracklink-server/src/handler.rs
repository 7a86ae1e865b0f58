//! Message handlers.
//!
//! Turns decoded terminal messages into device registry updates, downstream
//! jobs and acknowledgments.

use crate::config::Config;
use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::queue::{Job, JobKind, JobQueue, QueueError};
use crate::session::{ConnectionSession, SessionState};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracklink_core::{DeviceRegistry, DeviceSession};
use tracklink_protocol::{AckKind, DecodedMessage, LoginInfo, MessageKind, Payload};

/// Forwarding limits applied to location and alarm jobs.
#[derive(Debug, Clone, Copy)]
pub struct ForwardingLimits {
    /// Zero means never wait for queue capacity.
    pub enqueue_timeout: Duration,
    pub location_max_attempts: u32,
    pub alarm_max_attempts: u32,
}

impl Default for ForwardingLimits {
    fn default() -> Self {
        Self {
            enqueue_timeout: Duration::from_millis(500),
            location_max_attempts: 3,
            alarm_max_attempts: 5,
        }
    }
}

/// Message handler shared by all connections.
pub struct MessageHandler {
    devices: Arc<DeviceRegistry>,
    queue: Option<Arc<dyn JobQueue>>,
    /// Identities admitted at login; `None` admits all.
    allowlist: Option<HashSet<String>>,
    limits: ForwardingLimits,
    metrics: Option<Arc<Metrics>>,
}

impl MessageHandler {
    /// Creates a handler that forwards nothing and admits every device.
    pub fn new(devices: Arc<DeviceRegistry>) -> Self {
        Self {
            devices,
            queue: None,
            allowlist: None,
            limits: ForwardingLimits::default(),
            metrics: None,
        }
    }

    /// Creates a handler from the server configuration.
    pub fn from_config(devices: Arc<DeviceRegistry>, config: &Config) -> Self {
        Self::new(devices)
            .with_allowlist(config.devices.allowlist_set())
            .with_limits(ForwardingLimits {
                enqueue_timeout: config.forwarding.enqueue_timeout(),
                location_max_attempts: config.forwarding.location_max_attempts,
                alarm_max_attempts: config.forwarding.alarm_max_attempts,
            })
    }

    /// Sets the downstream job queue.
    pub fn with_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_allowlist(mut self, allowlist: Option<HashSet<String>>) -> Self {
        self.allowlist = allowlist;
        self
    }

    pub fn with_limits(mut self, limits: ForwardingLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.devices
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    /// Updates the online devices gauge.
    ///
    /// Devices whose connection is being torn down are no longer counted.
    pub fn update_gauge_metrics(&self) {
        if let Some(ref metrics) = self.metrics {
            metrics.devices_online.set(self.devices.online_count() as f64);
        }
    }

    /// Handles one decoded message and returns the acknowledgment to send.
    ///
    /// `LoginRejected` errors still expect a rejection ack before the
    /// connection closes; the caller writes it.
    pub async fn handle(
        &self,
        session: &mut ConnectionSession,
        message: &DecodedMessage,
    ) -> Result<Option<AckKind>, ServerError> {
        let kind = message.kind.as_str();
        let timer = self
            .metrics
            .as_ref()
            .map(|m| m.handle_duration.with_label_values(&[kind]).start_timer());
        if let Some(ref metrics) = self.metrics {
            metrics.frames_total.with_label_values(&[kind]).inc();
        }

        let addr = session.handle().remote_addr();
        let result = match &message.payload {
            Payload::Login(login) => self.handle_login(session, message, login),
            Payload::Location(_) | Payload::Alarm(_) => self.handle_fix(session, message).await,
            Payload::Heartbeat(_) => self.handle_heartbeat(session),
            Payload::Status(report) => self.handle_status(session, report.to_fields()),
            Payload::Unknown { body } => {
                tracing::debug!(
                    "[{}] Ignoring {} message type {:#04x} ({} byte body)",
                    addr,
                    message.protocol,
                    message.type_code,
                    body.len()
                );
                Ok(None)
            }
        };

        drop(timer);
        result
    }

    fn handle_login(
        &self,
        session: &mut ConnectionSession,
        message: &DecodedMessage,
        login: &LoginInfo,
    ) -> Result<Option<AckKind>, ServerError> {
        let addr = session.handle().remote_addr();
        let device_id = login.device_id.as_str();

        if let Some(ref allowlist) = self.allowlist {
            if !allowlist.contains(device_id) {
                tracing::warn!("[{}] Login rejected for device {}", addr, device_id);
                return Err(ServerError::LoginRejected {
                    device_id: device_id.to_string(),
                });
            }
        }

        // A terminal that logs in again under a new identity gives up the old one.
        if let Some(previous_id) = session.device_id() {
            if previous_id != device_id {
                self.devices
                    .unregister_connection(previous_id, session.handle().id());
            }
        }

        let entry = DeviceSession::new(device_id, session.handle().clone(), &message.protocol)
            .with_model_code(login.model_code);
        if let Some(previous) = self.devices.register(entry) {
            if previous.connection.id() != session.handle().id() {
                tracing::info!(
                    "[{}] Device {} superseded connection from {}",
                    addr,
                    device_id,
                    previous.connection.remote_addr()
                );
                previous.connection.close();
            }
        }

        session.identify(device_id);
        self.update_gauge_metrics();
        tracing::info!("[{}] Device {} logged in ({})", addr, device_id, message.protocol);
        Ok(Some(AckKind::LoginAccepted))
    }

    async fn handle_fix(
        &self,
        session: &ConnectionSession,
        message: &DecodedMessage,
    ) -> Result<Option<AckKind>, ServerError> {
        let addr = session.handle().remote_addr();
        let (Some(device_id), SessionState::Identified) = (session.device_id(), session.state())
        else {
            tracing::debug!("[{}] Dropping {} before login", addr, message.kind);
            self.record_drop("not_identified");
            return Ok(None);
        };

        let Some(fix) = message.location() else {
            return Ok(None);
        };
        if !fix.in_bounds() {
            tracing::warn!(
                "[{}] Device {} sent out of range coordinates ({}, {})",
                addr,
                device_id,
                fix.latitude,
                fix.longitude
            );
            self.record_drop("out_of_bounds");
            return Ok(Some(AckKind::Location));
        }

        let (job_kind, max_attempts) = match message.kind {
            MessageKind::Alarm => (JobKind::Alarm, self.limits.alarm_max_attempts),
            _ if !fix.valid => {
                tracing::debug!("[{}] Device {} has no GPS fix", addr, device_id);
                self.record_drop("no_fix");
                return Ok(Some(AckKind::Location));
            }
            _ => (JobKind::Location, self.limits.location_max_attempts),
        };

        let Some(ref queue) = self.queue else {
            return Ok(Some(AckKind::Location));
        };

        let payload = json!({
            "protocol": message.protocol,
            "type_code": message.type_code,
            "serial": message.serial,
            "received_at": message.timestamp,
            "data": message.payload,
        });
        let job = Job::new(device_id, job_kind, payload, max_attempts);

        let result = if self.limits.enqueue_timeout.is_zero() {
            queue.try_enqueue(job)
        } else {
            match tokio::time::timeout(self.limits.enqueue_timeout, queue.enqueue(job)).await {
                Ok(result) => result,
                Err(_) => Err(QueueError::Timeout(self.limits.enqueue_timeout)),
            }
        };

        match result {
            Ok(()) => {
                if let Some(ref metrics) = self.metrics {
                    metrics
                        .jobs_enqueued_total
                        .with_label_values(&[job_kind.as_str()])
                        .inc();
                }
                Ok(Some(AckKind::Location))
            }
            Err(e) => {
                self.record_drop("downstream_unavailable");
                Err(e.into())
            }
        }
    }

    fn handle_heartbeat(&self, session: &ConnectionSession) -> Result<Option<AckKind>, ServerError> {
        // Heartbeats are acknowledged before login too; only identified ones are tracked.
        if let Some(device_id) = session.device_id() {
            if !self.devices.touch_heartbeat(device_id) {
                tracing::debug!(
                    "[{}] Heartbeat for unregistered device {}",
                    session.handle().remote_addr(),
                    device_id
                );
            }
        }
        Ok(Some(AckKind::Heartbeat))
    }

    fn handle_status(
        &self,
        session: &ConnectionSession,
        fields: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Option<AckKind>, ServerError> {
        match session.device_id() {
            Some(device_id) => {
                if !self.devices.merge_status(device_id, fields) {
                    tracing::debug!(
                        "[{}] Status for unregistered device {}",
                        session.handle().remote_addr(),
                        device_id
                    );
                }
            }
            None => tracing::debug!(
                "[{}] Ignoring status before login",
                session.handle().remote_addr()
            ),
        }
        Ok(None)
    }

    fn record_drop(&self, reason: &str) {
        if let Some(ref metrics) = self.metrics {
            metrics.jobs_dropped_total.with_label_values(&[reason]).inc();
        }
    }
}
