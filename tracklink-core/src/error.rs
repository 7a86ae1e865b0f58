//! Core error types.

use thiserror::Error;

/// Errors from the device registry.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("device not found: {device_id}")]
    DeviceNotFound { device_id: String },
}

impl CoreError {
    /// Returns an error code suitable for logs and metrics.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::DeviceNotFound { .. } => "DEVICE_NOT_FOUND",
        }
    }
}
