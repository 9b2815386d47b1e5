//! Collaborators supplied by the UI layer.

use serde::Serialize;
use std::path::Path;

/// A classified, user-facing failure description
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserMessage {
    pub title: String,
    pub hint: String,
    pub detail: String,
}

impl UserMessage {
    pub fn new(title: impl Into<String>, hint: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            hint: hint.into(),
            detail: detail.into(),
        }
    }
}

/// Where preview frames end up
pub trait DisplaySurface: Send + Sync + 'static {
    /// Show the frame at `path`. `index` increases strictly between calls of one session.
    fn show_frame(&self, path: &Path, index: u64);

    /// Resize the viewport to the negotiated preview size
    fn resize(&self, width: u32, height: u32);
}

/// Receives failures that leave the user without a preview
pub trait ErrorReporter: Send + Sync + 'static {
    fn report(&self, message: &UserMessage);
}
