//! Error taxonomy for the preview core.

use crate::markers::CaptureFailure;
use crate::surface::UserMessage;
use peekcam_config::SettingsError;
use thiserror::Error;

/// Error type for preview operations
#[derive(Debug, Error)]
pub enum PreviewError {
    /// External command could not be started
    #[error("Failed to spawn {command}: {message}")]
    Spawn { command: String, message: String },

    /// External command outlived its budget and was killed
    #[error("{command} timed out after {after_ms}ms")]
    Timeout { command: String, after_ms: u64 },

    /// A required helper binary is not installed
    #[error("Required tool not found: {0}")]
    ToolMissing(String),

    /// Device missing, not readable, or the pipeline could not use it
    #[error("Camera unavailable: {0}")]
    DeviceUnavailable(CaptureFailure),

    /// Teardown left something behind. Logged, never fatal.
    #[error("Cleanup incomplete: {0}")]
    Cleanup(String),

    /// Stopped or shut down while discovery was still running
    #[error("Cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),
}

impl From<CaptureFailure> for PreviewError {
    fn from(failure: CaptureFailure) -> Self {
        match failure {
            CaptureFailure::ToolMissing => PreviewError::ToolMissing("gst-launch-1.0".to_string()),
            other => PreviewError::DeviceUnavailable(other),
        }
    }
}

impl PreviewError {
    /// Classification used when this error ends a preview attempt
    pub fn failure(&self) -> CaptureFailure {
        match self {
            PreviewError::ToolMissing(_) => CaptureFailure::ToolMissing,
            PreviewError::DeviceUnavailable(failure) => failure.clone(),
            other => CaptureFailure::StartFailed(other.to_string()),
        }
    }

    pub fn user_message(&self) -> UserMessage {
        self.failure().user_message()
    }
}
