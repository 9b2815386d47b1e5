//! Capability probing for a single camera device.
//!
//! A probe is a cascade of three checks of increasing cost: the driver's
//! declared capabilities, the advertised pixel formats, and one real frame
//! pulled through GStreamer. The first failing stage ends the cascade.

use crate::runner::{shell_quote, CommandRunner, CommandSpec};
use peekcam_config::ProbeConfig;
use serde::Serialize;
use std::fs::File;
use std::future::Future;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Longest card name shown before falling back to a generic label
const MAX_NAME_LEN: usize = 50;

/// Stages of the probe cascade, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStage {
    Capability,
    Format,
    Capture,
}

/// Outcome of probing one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub device: PathBuf,
    /// True only if every stage passed
    pub works: bool,
    /// Last stage that ran
    pub stage: ProbeStage,
    pub latency_ms: u64,
}

/// Anything that can tell whether a device delivers frames
pub trait DeviceProbe: Send + Sync + 'static {
    fn probe(&self, device: &Path) -> impl Future<Output = ProbeResult> + Send;
}

/// A working camera with its display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CameraInfo {
    pub device: PathBuf,
    pub name: String,
    /// `"<name> (<path>)"`
    pub label: String,
}

impl CameraInfo {
    pub fn new(device: PathBuf, name: String) -> Self {
        let label = format!("{} ({})", name, device.display());
        Self {
            device,
            name,
            label,
        }
    }
}

/// Runs the three-stage cascade through a [`CommandRunner`]
pub struct CapabilityProber<R> {
    runner: Arc<R>,
    timeouts: ProbeConfig,
}

impl<R: CommandRunner> CapabilityProber<R> {
    pub fn new(runner: Arc<R>, timeouts: ProbeConfig) -> Self {
        Self { runner, timeouts }
    }

    pub fn runner(&self) -> &Arc<R> {
        &self.runner
    }

    async fn cascade(&self, device: &Path) -> (bool, ProbeStage) {
        if !self.check_capability(device).await {
            return (false, ProbeStage::Capability);
        }
        if !self.check_formats(device).await {
            return (false, ProbeStage::Format);
        }
        (self.check_capture(device).await, ProbeStage::Capture)
    }

    /// Stage 1: does the driver declare video capture?
    ///
    /// A definite answer from `v4l2-ctl` is final. Without one, the device
    /// passes if it is a readable character device.
    pub async fn check_capability(&self, device: &Path) -> bool {
        let spec = info_command(device);
        let output = self
            .runner
            .run(spec.clone(), self.timeouts.capability_timeout())
            .await;

        if output.success() {
            if let Some(capture) = has_video_capture(&output.stdout) {
                debug!(device = %device.display(), capture, "device caps");
                return capture;
            }
        } else if let Some(err) = output.error(&spec) {
            debug!(device = %device.display(), error = %err, "capability query unavailable");
        }

        self.check_char_device(device).await
    }

    async fn check_char_device(&self, device: &Path) -> bool {
        let path = device.to_path_buf();
        let check = tokio::task::spawn_blocking(move || is_readable_char_device(&path));
        match tokio::time::timeout(self.timeouts.fallback_timeout(), check).await {
            Ok(Ok(readable)) => readable,
            _ => false,
        }
    }

    /// Stage 2: at least one pixel format is advertised
    ///
    /// Passes when `v4l2-ctl` is not installed so the capture test decides.
    pub async fn check_formats(&self, device: &Path) -> bool {
        let spec = CommandSpec::new("v4l2-ctl")
            .arg(format!("--device={}", device.display()))
            .arg("--list-formats");
        let output = self
            .runner
            .run(spec, self.timeouts.format_timeout())
            .await;

        if output.tool_missing() {
            debug!(device = %device.display(), "v4l2-ctl missing, skipping format check");
            return true;
        }
        output.success() && count_formats(&output.stdout) > 0
    }

    /// Stage 3: pull one real frame through the decoder
    pub async fn check_capture(&self, device: &Path) -> bool {
        let spec = CommandSpec::shell(capture_test_script(device, &self.timeouts));
        let output = self
            .runner
            .run(spec, self.timeouts.capture_timeout())
            .await;
        output.success() && output.stdout.trim() == "success"
    }

    /// Card name of `device`, or `Camera <index>` when unusable
    pub async fn camera_name(&self, device: &Path, index: usize) -> String {
        let output = self
            .runner
            .run(info_command(device), self.timeouts.capability_timeout())
            .await;
        let card = if output.success() {
            parse_card_type(&output.stdout)
        } else {
            None
        };
        display_name(card, index)
    }
}

impl<R: CommandRunner> DeviceProbe for CapabilityProber<R> {
    fn probe(&self, device: &Path) -> impl Future<Output = ProbeResult> + Send {
        async move {
            let started = Instant::now();
            let (works, stage) = self.cascade(device).await;
            let result = ProbeResult {
                device: device.to_path_buf(),
                works,
                stage,
                latency_ms: started.elapsed().as_millis() as u64,
            };
            debug!(
                device = %device.display(),
                works,
                stage = ?stage,
                latency_ms = result.latency_ms,
                "probe finished"
            );
            result
        }
    }
}

fn info_command(device: &Path) -> CommandSpec {
    CommandSpec::new("v4l2-ctl")
        .arg(format!("--device={}", device.display()))
        .arg("--info")
}

/// One-frame pipeline that prints `success` or `fail`
fn capture_test_script(device: &Path, timeouts: &ProbeConfig) -> String {
    // Inner limit stays a second under the outer budget
    let inner_secs = (timeouts.capture_timeout_ms.saturating_sub(1000) / 1000).max(1);
    format!(
        "timeout {}s gst-launch-1.0 v4l2src device={} num-buffers=1 ! decodebin ! videoconvert ! videoscale ! video/x-raw,width=320,height=240 ! fakesink >/dev/null 2>&1 && echo success || echo fail",
        inner_secs,
        shell_quote(&device.to_string_lossy())
    )
}

fn is_readable_char_device(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) if meta.file_type().is_char_device() => File::open(path).is_ok(),
        _ => false,
    }
}

fn indentation(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

/// Whether the `Device Caps` block of `v4l2-ctl --info` lists video capture
///
/// `None` when the output has no such block.
pub fn has_video_capture(info: &str) -> Option<bool> {
    let mut lines = info.lines();
    let header = lines
        .by_ref()
        .find(|line| line.trim_start().starts_with("Device Caps"))?;
    let depth = indentation(header);
    let listed = lines
        .take_while(|line| !line.trim().is_empty() && indentation(line) > depth)
        .any(|line| line.contains("Video Capture"));
    Some(listed)
}

/// Number of `[n]: ...` entries in `v4l2-ctl --list-formats` output
pub fn count_formats(listing: &str) -> usize {
    listing
        .lines()
        .filter(|line| {
            let Some(rest) = line.trim_start().strip_prefix('[') else {
                return false;
            };
            let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
            digits > 0 && rest[digits..].starts_with("]:")
        })
        .count()
}

/// Value of the `Card type` line of `v4l2-ctl --info`
pub fn parse_card_type(info: &str) -> Option<String> {
    info.lines()
        .find(|line| line.trim_start().starts_with("Card type"))
        .and_then(|line| line.split_once(':'))
        .map(|(_, value)| value.trim().to_string())
}

pub fn display_name(card: Option<String>, index: usize) -> String {
    match card {
        Some(name) if !name.is_empty() && name.chars().count() <= MAX_NAME_LEN => name,
        _ => format!("Camera {}", index),
    }
}
