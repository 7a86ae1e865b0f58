//! Connection session - one socket's receive buffer and protocol state.
//!
//! Bytes are appended as they arrive and drained frame by frame. The first
//! bytes pick the protocol, which then stays pinned for the connection's
//! lifetime.

use crate::config::CorruptFramePolicy;
use crate::error::ServerError;
use bytes::{Buf, BytesMut};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracklink_core::ConnectionHandle;
use tracklink_protocol::{
    DecodedMessage, Detection, FrameCodec, ProtocolError, ProtocolRegistry, MAGIC,
};

/// Bytes of an unrecognised prefix reported in errors.
const PREFIX_PREVIEW: usize = 8;

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, identity not yet known.
    Anonymous,
    /// A LOGIN was accepted.
    Identified,
    /// Terminal state; nothing more is decoded.
    Closed,
}

/// Per-connection limits.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub max_buffer_bytes: usize,
    pub corrupt_frame_policy: CorruptFramePolicy,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_buffer_bytes: 4096,
            corrupt_frame_policy: CorruptFramePolicy::Close,
        }
    }
}

/// Something the drain loop produced.
#[derive(Debug)]
pub enum SessionEvent {
    /// A fully decoded message.
    Message(DecodedMessage),
    /// A checksum-valid frame whose fields did not decode; it was skipped.
    Skipped(ProtocolError),
    /// The stream was corrupt and `discarded` bytes were dropped to find the next frame.
    Resynced {
        discarded: usize,
        error: ProtocolError,
    },
}

/// A terminal connection.
pub struct ConnectionSession {
    handle: ConnectionHandle,
    state: SessionState,
    device_id: Option<String>,
    codec: Option<Arc<dyn FrameCodec>>,
    buffer: BytesMut,
    limits: SessionLimits,
    created_at: Instant,
    last_activity: Instant,
    frames_decoded: u64,
}

impl ConnectionSession {
    pub fn new(handle: ConnectionHandle, limits: SessionLimits) -> Self {
        let now = Instant::now();
        Self {
            handle,
            state: SessionState::Anonymous,
            device_id: None,
            codec: None,
            buffer: BytesMut::with_capacity(limits.max_buffer_bytes.min(1024)),
            limits,
            created_at: now,
            last_activity: now,
            frames_decoded: 0,
        }
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Identity from the accepted LOGIN, if any.
    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    /// Codec the connection is pinned to.
    pub fn codec(&self) -> Option<Arc<dyn FrameCodec>> {
        self.codec.clone()
    }

    pub fn protocol(&self) -> Option<&str> {
        self.codec.as_deref().map(|c| c.name())
    }

    /// Bytes received but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_duration(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Marks the session identified as `device_id`.
    pub fn identify(&mut self, device_id: impl Into<String>) {
        if self.state == SessionState::Closed {
            return;
        }
        self.device_id = Some(device_id.into());
        self.state = SessionState::Identified;
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    /// Appends received bytes.
    ///
    /// The buffer limit is enforced on what is left after draining, so a read
    /// holding several complete frames is always accepted.
    pub fn extend(&mut self, data: &[u8]) -> Result<(), ServerError> {
        if self.state == SessionState::Closed {
            return Err(ServerError::ShuttingDown);
        }
        self.last_activity = Instant::now();
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    /// Drains the next event from the buffer.
    ///
    /// Returns `Ok(None)` when more bytes are needed. An `Err` is fatal for
    /// the connection and leaves the session closed.
    pub fn next_event(
        &mut self,
        protocols: &ProtocolRegistry,
    ) -> Result<Option<SessionEvent>, ServerError> {
        if self.state == SessionState::Closed || self.buffer.is_empty() {
            return Ok(None);
        }

        let codec = match self.codec.clone() {
            Some(codec) => codec,
            None => match self.detect(protocols)? {
                Some(codec) => codec,
                None => return self.wait_for_more(),
            },
        };

        match codec.decode(&self.buffer) {
            Ok(None) => self.wait_for_more(),
            Ok(Some(decoded)) => {
                self.buffer.advance(decoded.consumed);
                self.frames_decoded += 1;
                let mut message = decoded.message;
                message.device_id = self.device_id.clone();
                Ok(Some(SessionEvent::Message(message)))
            }
            Err(e) => match e.skippable_len() {
                Some(len) => {
                    self.buffer.advance(len.min(self.buffer.len()));
                    Ok(Some(SessionEvent::Skipped(e)))
                }
                None if e.is_stream_corrupt()
                    && self.limits.corrupt_frame_policy == CorruptFramePolicy::Resync =>
                {
                    let discarded = self.resync();
                    Ok(Some(SessionEvent::Resynced { discarded, error: e }))
                }
                None => {
                    self.close();
                    Err(e.into())
                }
            },
        }
    }

    /// Bytes left undecoded must fit the buffer limit.
    fn wait_for_more(&mut self) -> Result<Option<SessionEvent>, ServerError> {
        let size = self.buffer.len();
        if size > self.limits.max_buffer_bytes {
            self.close();
            return Err(ServerError::BufferOverflow {
                size,
                max: self.limits.max_buffer_bytes,
            });
        }
        Ok(None)
    }

    fn detect(
        &mut self,
        protocols: &ProtocolRegistry,
    ) -> Result<Option<Arc<dyn FrameCodec>>, ServerError> {
        let unknown = |buffer: &BytesMut| ServerError::UnknownProtocol {
            prefix: hex::encode(&buffer[..buffer.len().min(PREFIX_PREVIEW)]),
        };

        match protocols.identify(&self.buffer) {
            Detection::NeedMore => Ok(None),
            Detection::NoMatch => {
                self.close();
                Err(unknown(&self.buffer))
            }
            Detection::Match(name) => match protocols.get(&name) {
                Some(codec) => {
                    tracing::debug!(
                        "[{}] Protocol detected: {}",
                        self.handle.remote_addr(),
                        name
                    );
                    self.codec = Some(codec.clone());
                    Ok(Some(codec))
                }
                None => {
                    self.close();
                    Err(unknown(&self.buffer))
                }
            },
        }
    }

    /// Drops bytes up to the next start marker after offset 0.
    ///
    /// A trailing lone first marker byte is kept, since the rest of the marker
    /// may arrive with the next read.
    fn resync(&mut self) -> usize {
        let before = self.buffer.len();
        let next = self
            .buffer
            .windows(MAGIC.len())
            .skip(1)
            .position(|w| w == MAGIC)
            .map(|pos| pos + 1);

        let discard = match next {
            Some(pos) => pos,
            None if before > 1 && self.buffer[before - 1] == MAGIC[0] => before - 1,
            None => before,
        };
        self.buffer.advance(discard);
        discard
    }
}
