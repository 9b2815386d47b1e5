//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Where camera devices live and which one to fall back to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    /// Device used when nothing has been selected yet (default /dev/video0)
    #[serde(default = "default_device_path")]
    pub default_path: PathBuf,
    /// Directory scanned for `video<N>` nodes (default /dev)
    #[serde(default = "default_device_dir")]
    pub device_dir: PathBuf,
    /// Upper bound on candidates returned by any enumeration strategy
    #[serde(default = "default_max_devices")]
    pub max_devices: u32,
}

fn default_device_path() -> PathBuf {
    PathBuf::from("/dev/video0")
}

fn default_device_dir() -> PathBuf {
    PathBuf::from("/dev")
}

fn default_max_devices() -> u32 {
    20
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            default_path: default_device_path(),
            device_dir: default_device_dir(),
            max_devices: default_max_devices(),
        }
    }
}

/// Timeouts for the probe cascade and the validation watchdog, in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeConfig {
    #[serde(default = "default_capability_timeout_ms")]
    pub capability_timeout_ms: u64,
    /// Budget for the native character-device fallback check
    #[serde(default = "default_fallback_timeout_ms")]
    pub fallback_timeout_ms: u64,
    #[serde(default = "default_format_timeout_ms")]
    pub format_timeout_ms: u64,
    /// Outer limit for the one-frame capture test
    #[serde(default = "default_capture_timeout_ms")]
    pub capture_timeout_ms: u64,
    /// Limit for each device listing command
    #[serde(default = "default_detection_timeout_ms")]
    pub detection_timeout_ms: u64,
    /// Parallel validation is finalized after this long regardless of stragglers
    #[serde(default = "default_watchdog_ms")]
    pub watchdog_ms: u64,
}

fn default_capability_timeout_ms() -> u64 {
    2000
}

fn default_fallback_timeout_ms() -> u64 {
    1000
}

fn default_format_timeout_ms() -> u64 {
    2000
}

fn default_capture_timeout_ms() -> u64 {
    4000
}

fn default_detection_timeout_ms() -> u64 {
    3000
}

fn default_watchdog_ms() -> u64 {
    10_000
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            capability_timeout_ms: default_capability_timeout_ms(),
            fallback_timeout_ms: default_fallback_timeout_ms(),
            format_timeout_ms: default_format_timeout_ms(),
            capture_timeout_ms: default_capture_timeout_ms(),
            detection_timeout_ms: default_detection_timeout_ms(),
            watchdog_ms: default_watchdog_ms(),
        }
    }
}

impl ProbeConfig {
    pub fn capability_timeout(&self) -> Duration {
        Duration::from_millis(self.capability_timeout_ms)
    }

    pub fn fallback_timeout(&self) -> Duration {
        Duration::from_millis(self.fallback_timeout_ms)
    }

    pub fn format_timeout(&self) -> Duration {
        Duration::from_millis(self.format_timeout_ms)
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }

    pub fn detection_timeout(&self) -> Duration {
        Duration::from_millis(self.detection_timeout_ms)
    }

    pub fn watchdog(&self) -> Duration {
        Duration::from_millis(self.watchdog_ms)
    }
}

/// Live preview capture settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaptureConfig {
    /// Delay between frame polls (default 33ms, roughly 30 per second)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Time allowed for the first frame to appear
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    /// Number of JPEG files kept in the frame ring
    #[serde(default = "default_ring_size")]
    pub ring_size: u32,
    /// Width of the preview image; height follows the camera's aspect
    #[serde(default = "default_preview_width")]
    pub preview_width: u32,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u32,
    /// Parent of the per-session working directory (system temp dir if None)
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
}

fn default_poll_interval_ms() -> u64 {
    33
}

fn default_startup_timeout_ms() -> u64 {
    4000
}

fn default_ring_size() -> u32 {
    5
}

fn default_preview_width() -> u32 {
    480
}

fn default_jpeg_quality() -> u32 {
    85
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            startup_timeout_ms: default_startup_timeout_ms(),
            ring_size: default_ring_size(),
            preview_width: default_preview_width(),
            jpeg_quality: default_jpeg_quality(),
            temp_dir: None,
        }
    }
}

impl CaptureConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    /// Directory under which session working directories are created
    pub fn temp_root(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(env::temp_dir)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - PEEKCAM_DEVICE -> device.default_path
    /// - PEEKCAM_DEVICE_DIR -> device.device_dir
    /// - PEEKCAM_WATCHDOG_MS -> probe.watchdog_ms
    /// - PEEKCAM_POLL_INTERVAL_MS -> capture.poll_interval_ms
    /// - PEEKCAM_STARTUP_TIMEOUT_MS -> capture.startup_timeout_ms
    /// - PEEKCAM_TEMP_DIR -> capture.temp_dir
    ///
    /// Empty or unparsable values leave the existing setting untouched.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("PEEKCAM_DEVICE") {
            if !val.trim().is_empty() {
                self.device.default_path = PathBuf::from(val.trim());
            }
        }

        if let Ok(val) = env::var("PEEKCAM_DEVICE_DIR") {
            if !val.trim().is_empty() {
                self.device.device_dir = PathBuf::from(val.trim());
            }
        }

        if let Ok(val) = env::var("PEEKCAM_WATCHDOG_MS") {
            if let Ok(ms) = val.trim().parse::<u64>() {
                self.probe.watchdog_ms = ms;
            }
        }

        if let Ok(val) = env::var("PEEKCAM_POLL_INTERVAL_MS") {
            if let Ok(ms) = val.trim().parse::<u64>() {
                self.capture.poll_interval_ms = ms;
            }
        }

        if let Ok(val) = env::var("PEEKCAM_STARTUP_TIMEOUT_MS") {
            if let Ok(ms) = val.trim().parse::<u64>() {
                self.capture.startup_timeout_ms = ms;
            }
        }

        if let Ok(val) = env::var("PEEKCAM_TEMP_DIR") {
            if !val.trim().is_empty() {
                self.capture.temp_dir = Some(PathBuf::from(val.trim()));
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults
    ///
    /// Parse errors and other IO errors are still reported.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = match Self::load_from_file(path) {
            Ok(config) => config,
            Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Config::default()
            }
            Err(e) => return Err(e),
        };
        config.apply_env_overrides();
        Ok(config)
    }
}
