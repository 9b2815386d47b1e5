//! Marker files shared with the capture script.
//!
//! The script reports back only through small files in the session's working
//! directory: its pid, the negotiated resolution, an error code, and the
//! numbered frames themselves.

use crate::pipeline::Resolution;
use crate::surface::UserMessage;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const PID_FILE: &str = "pid";
pub const SCRIPT_FILE: &str = "capture.sh";
pub const ERROR_MARKER: &str = "camera_error";
pub const RESOLUTION_MARKER: &str = "resolution";
pub const FRAMES_DIR: &str = "frames";
pub const FRAME_PATTERN: &str = "frame_%05d.jpg";

/// Why a preview could not be shown
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureFailure {
    #[error("GStreamer is not installed")]
    ToolMissing,

    #[error("camera device not found")]
    DeviceNotFound,

    #[error("permission denied on camera device")]
    PermissionDenied,

    #[error("capture pipeline failed")]
    PipelineError,

    #[error("no frame before the startup timeout")]
    StartTimeout,

    #[error("{0}")]
    StartFailed(String),
}

impl CaptureFailure {
    /// Classify the contents of the error marker. Unknown codes are pipeline errors.
    pub fn from_marker(contents: &str) -> Self {
        match contents.trim() {
            "GSTREAMER_MISSING" => CaptureFailure::ToolMissing,
            "DEVICE_NOT_FOUND" => CaptureFailure::DeviceNotFound,
            "PERMISSION_DENIED" => CaptureFailure::PermissionDenied,
            _ => CaptureFailure::PipelineError,
        }
    }

    pub fn user_message(&self) -> UserMessage {
        match self {
            CaptureFailure::ToolMissing => UserMessage::new(
                "GStreamer Not Found",
                "Install GStreamer",
                "Please install GStreamer: sudo apt install gstreamer1.0-tools gstreamer1.0-plugins-base gstreamer1.0-plugins-good",
            ),
            CaptureFailure::DeviceNotFound => UserMessage::new(
                "No Camera Found",
                "Connect a camera device",
                "Make sure your camera is connected and recognized by the system.",
            ),
            CaptureFailure::PermissionDenied => UserMessage::new(
                "Permission Denied",
                "Check permissions",
                "Add your user to the video group: sudo usermod -a -G video $USER (then log out and back in)",
            ),
            CaptureFailure::PipelineError => UserMessage::new(
                "Camera Error",
                "Try again",
                "The camera might be in use by another application or not working properly.",
            ),
            CaptureFailure::StartTimeout => UserMessage::new(
                "Camera couldn't be started",
                "Try again",
                "The camera might be in use by another application.",
            ),
            CaptureFailure::StartFailed(reason) => {
                UserMessage::new("Error starting camera", "Try again", reason.clone())
            }
        }
    }
}

/// Classified error marker, if the script wrote one
///
/// An empty marker is still being written and reads as absent.
pub async fn read_error_marker(work_dir: &Path) -> Option<CaptureFailure> {
    tokio::fs::read_to_string(work_dir.join(ERROR_MARKER))
        .await
        .ok()
        .filter(|contents| !contents.trim().is_empty())
        .map(|contents| CaptureFailure::from_marker(&contents))
}

pub async fn read_resolution(work_dir: &Path) -> Option<Resolution> {
    let contents = tokio::fs::read_to_string(work_dir.join(RESOLUTION_MARKER))
        .await
        .ok()?;
    Resolution::parse(&contents)
}

pub async fn read_pid(work_dir: &Path) -> Option<u32> {
    let contents = tokio::fs::read_to_string(work_dir.join(PID_FILE)).await.ok()?;
    contents.trim().parse().ok().filter(|pid| *pid > 0)
}

/// A frame file in the ring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub index: u64,
    pub path: PathBuf,
}

/// `N` of `frame_N.jpg`
pub fn frame_index(name: &str) -> Option<u64> {
    let digits = name.strip_prefix("frame_")?.strip_suffix(".jpg")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Highest-numbered frame in `frames_dir`
pub async fn find_newest_frame(frames_dir: &Path) -> Option<Frame> {
    let mut entries = tokio::fs::read_dir(frames_dir).await.ok()?;
    let mut newest: Option<Frame> = None;

    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(index) = name.to_str().and_then(frame_index) else {
            continue;
        };
        if newest.as_ref().map_or(true, |frame| index > frame.index) {
            newest = Some(Frame {
                index,
                path: entry.path(),
            });
        }
    }
    newest
}
