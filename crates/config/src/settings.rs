//! Persistent key/value settings.
//!
//! The JSON store writes through on every `set`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// Key under which the selected camera device path is stored
pub const CAMERA_DEVICE_KEY: &str = "camera-device";

/// Error type for settings persistence
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Settings IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Settings file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// String settings shared between the UI layer and the preview core
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    /// Last write wins
    fn set(&self, key: &str, value: &str) -> Result<(), SettingsError>;
}

/// In-process store, nothing is persisted
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SettingsError> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Flat JSON object on disk, e.g. `{"camera-device": "/dev/video2"}`
#[derive(Debug)]
pub struct JsonSettingsStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl JsonSettingsStore {
    /// Open the store at `path`. A missing file is an empty store.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref().to_path_buf();
        let values = match fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &BTreeMap<String, String>) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(values)?;
        // Readers never observe a partially written file
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl SettingsStore for JsonSettingsStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SettingsError> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_string(), value.to_string());
        self.persist(&values)
    }
}
