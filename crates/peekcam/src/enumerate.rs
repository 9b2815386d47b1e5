//! Discovery of candidate camera devices.
//!
//! Strategies are tried in order and the first one that finds anything wins.
//! Finding nothing is a normal outcome, not an error.

use crate::runner::{CommandRunner, CommandSpec};
use peekcam_config::{DeviceConfig, ProbeConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use walkdir::WalkDir;

/// A filesystem path naming a capture device, e.g. `/dev/video0`
pub type DeviceCandidate = PathBuf;

/// Enumeration strategies, cheapest first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// `video<N>` entries of the device directory
    DirectoryListing,
    /// Paths reported by `v4l2-ctl --list-devices`
    ToolListing,
    /// `video0 .. video<max-1>` checked one by one
    BruteForce,
}

impl Strategy {
    pub const ALL: [Strategy; 3] = [
        Strategy::DirectoryListing,
        Strategy::ToolListing,
        Strategy::BruteForce,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Strategy::DirectoryListing => "directory listing",
            Strategy::ToolListing => "v4l2-ctl listing",
            Strategy::BruteForce => "brute force",
        }
    }
}

/// Index `N` of a `video<N>` device node
pub fn video_index(path: &Path) -> Option<u32> {
    path.file_name()?
        .to_str()?
        .strip_prefix("video")
        .filter(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))?
        .parse::<u32>()
        .ok()
}

/// Sort by device index, drop duplicates, apply the cap
fn normalize(mut devices: Vec<PathBuf>, max: usize) -> Vec<PathBuf> {
    devices.sort_by_key(|path| video_index(path).unwrap_or(u32::MAX));
    devices.dedup();
    devices.truncate(max);
    devices
}

pub struct DeviceEnumerator<R> {
    runner: Arc<R>,
    device_dir: PathBuf,
    max_devices: usize,
    detection_timeout: Duration,
}

impl<R: CommandRunner> DeviceEnumerator<R> {
    pub fn new(runner: Arc<R>, device: &DeviceConfig, probe: &ProbeConfig) -> Self {
        Self {
            runner,
            device_dir: device.device_dir.clone(),
            max_devices: device.max_devices as usize,
            detection_timeout: probe.detection_timeout(),
        }
    }

    /// Candidates from the first strategy that yields any
    pub async fn enumerate(&self) -> Vec<DeviceCandidate> {
        for strategy in Strategy::ALL {
            let found = self.run_strategy(strategy).await;
            if !found.is_empty() {
                info!(
                    strategy = strategy.as_str(),
                    count = found.len(),
                    "found camera device candidates"
                );
                return found;
            }
            debug!(strategy = strategy.as_str(), "no devices");
        }
        info!("no camera devices found");
        Vec::new()
    }

    pub async fn run_strategy(&self, strategy: Strategy) -> Vec<DeviceCandidate> {
        match strategy {
            Strategy::DirectoryListing => self.list_directory().await,
            Strategy::ToolListing => self.list_with_tool().await,
            Strategy::BruteForce => self.brute_force().await,
        }
    }

    async fn list_directory(&self) -> Vec<PathBuf> {
        let dir = self.device_dir.clone();
        let max = self.max_devices;
        let listing = tokio::task::spawn_blocking(move || {
            let found = WalkDir::new(&dir)
                .min_depth(1)
                .max_depth(1)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|entry| !entry.file_type().is_dir())
                .map(|entry| entry.into_path())
                .filter(|path| video_index(path).is_some())
                .collect();
            normalize(found, max)
        });
        match tokio::time::timeout(self.detection_timeout, listing).await {
            Ok(Ok(found)) => found,
            _ => Vec::new(),
        }
    }

    async fn list_with_tool(&self) -> Vec<PathBuf> {
        let output = self
            .runner
            .run(
                CommandSpec::new("v4l2-ctl").arg("--list-devices"),
                self.detection_timeout,
            )
            .await;
        if !output.success() {
            return Vec::new();
        }
        let found = parse_device_listing(&output.stdout, &self.device_dir);
        normalize(found, self.max_devices)
    }

    async fn brute_force(&self) -> Vec<PathBuf> {
        let dir = self.device_dir.clone();
        let max = self.max_devices;
        let probe = tokio::task::spawn_blocking(move || {
            (0..max)
                .map(|i| dir.join(format!("video{}", i)))
                .filter(|path| path.exists())
                .collect::<Vec<_>>()
        });
        match tokio::time::timeout(self.detection_timeout, probe).await {
            Ok(Ok(found)) => found,
            _ => Vec::new(),
        }
    }
}

/// Device paths under `device_dir` named in `v4l2-ctl --list-devices` output
pub fn parse_device_listing(listing: &str, device_dir: &Path) -> Vec<PathBuf> {
    listing
        .lines()
        .map(str::trim)
        .map(PathBuf::from)
        .filter(|path| path.parent() == Some(device_dir) && video_index(path).is_some())
        .collect()
}
