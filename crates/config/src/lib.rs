//! Configuration for PeekCam
//!
//! Handles loading configuration from TOML files and environment variable overrides,
//! and the key/value store that remembers the selected camera.

pub mod config;
pub mod settings;

pub use config::*;
pub use settings::{
    JsonSettingsStore, MemorySettingsStore, SettingsError, SettingsStore, CAMERA_DEVICE_KEY,
};
