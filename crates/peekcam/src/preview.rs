//! The preview state machine exposed to the UI layer.
//!
//! `idle -> discovering -> validating -> previewing`, ending in `error` or
//! `stopped`. Discovery only runs when the stored device is missing or fails
//! its probe; an explicit selection is always trusted.

use crate::enumerate::DeviceEnumerator;
use crate::error::PreviewError;
use crate::probe::{CameraInfo, CapabilityProber, DeviceProbe};
use crate::runner::CommandRunner;
use crate::supervisor::CaptureSupervisor;
use crate::surface::{DisplaySurface, ErrorReporter};
use crate::validate::{ParallelValidator, Validation};
use peekcam_config::{Config, DeviceConfig, SettingsStore, CAMERA_DEVICE_KEY};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewState {
    Idle,
    Discovering,
    Validating,
    Previewing,
    Error,
    Stopped,
}

impl PreviewState {
    pub fn as_str(&self) -> &str {
        match self {
            PreviewState::Idle => "idle",
            PreviewState::Discovering => "discovering",
            PreviewState::Validating => "validating",
            PreviewState::Previewing => "previewing",
            PreviewState::Error => "error",
            PreviewState::Stopped => "stopped",
        }
    }
}

pub struct PreviewController<R: CommandRunner> {
    device: DeviceConfig,
    runner: Arc<R>,
    settings: Arc<dyn SettingsStore>,
    enumerator: DeviceEnumerator<R>,
    validator: ParallelValidator<CapabilityProber<R>>,
    supervisor: CaptureSupervisor<R>,
    phase: Mutex<PreviewState>,
    /// The stored device has passed its probe or was picked explicitly
    verified: AtomicBool,
    /// Bumped by every stop; a start begun under an older value is abandoned
    stops: AtomicU64,
}

impl<R: CommandRunner> PreviewController<R> {
    pub fn new(
        runner: Arc<R>,
        config: &Config,
        settings: Arc<dyn SettingsStore>,
        surface: Arc<dyn DisplaySurface>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        let prober = Arc::new(CapabilityProber::new(runner.clone(), config.probe.clone()));
        Self {
            device: config.device.clone(),
            enumerator: DeviceEnumerator::new(runner.clone(), &config.device, &config.probe),
            validator: ParallelValidator::new(prober, config.probe.watchdog()),
            supervisor: CaptureSupervisor::new(runner.clone(), config, surface, reporter),
            runner,
            settings,
            phase: Mutex::new(PreviewState::Idle),
            verified: AtomicBool::new(false),
            stops: AtomicU64::new(0),
        }
    }

    fn phase(&self) -> MutexGuard<'_, PreviewState> {
        self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_phase(&self, state: PreviewState) {
        let mut phase = self.phase();
        if *phase != state {
            debug!(from = phase.as_str(), to = state.as_str(), "preview state");
            *phase = state;
        }
    }

    /// Current state. A preview whose session has ended reports `error` or `idle`.
    pub fn state(&self) -> PreviewState {
        let phase = *self.phase();
        match phase {
            PreviewState::Previewing if !self.supervisor.is_active() => {
                if self.supervisor.last_failure().is_some() {
                    PreviewState::Error
                } else {
                    PreviewState::Idle
                }
            }
            other => other,
        }
    }

    pub fn supervisor(&self) -> &CaptureSupervisor<R> {
        &self.supervisor
    }

    pub fn stored_device(&self) -> Option<PathBuf> {
        self.settings
            .get(CAMERA_DEVICE_KEY)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
    }

    fn store_device(&self, device: &Path) -> Result<(), PreviewError> {
        self.settings
            .set(CAMERA_DEVICE_KEY, &device.to_string_lossy())?;
        info!(device = %device.display(), "camera device stored");
        Ok(())
    }

    fn stop_count(&self) -> u64 {
        self.stops.load(Ordering::SeqCst)
    }

    fn stopped_since(&self, count: u64) -> bool {
        self.stop_count() != count
    }

    /// Device the next preview will use, recovering when the stored one is unusable
    pub async fn resolve_device(&self) -> Result<PathBuf, PreviewError> {
        let stops = self.stop_count();
        let stored = self.stored_device();
        if let Some(device) = &stored {
            if self.verified.load(Ordering::SeqCst) {
                return Ok(device.clone());
            }
            let result = self.validator.probe().probe(device).await;
            if self.stopped_since(stops) {
                return Err(PreviewError::Cancelled);
            }
            if result.works {
                self.verified.store(true, Ordering::SeqCst);
                return Ok(device.clone());
            }
            info!(
                device = %device.display(),
                stage = ?result.stage,
                "stored camera failed its probe, searching for another"
            );
        }
        self.recover(stored, stops).await
    }

    async fn recover(&self, stored: Option<PathBuf>, stops: u64) -> Result<PathBuf, PreviewError> {
        self.set_phase(PreviewState::Discovering);
        let candidates = self.enumerator.enumerate().await;
        if self.stopped_since(stops) {
            return Err(PreviewError::Cancelled);
        }

        let chosen = match candidates.as_slice() {
            [] => {
                return match stored {
                    Some(device) => Ok(device),
                    None => {
                        let fallback = self.device.default_path.clone();
                        self.store_device(&fallback)?;
                        Ok(fallback)
                    }
                }
            }
            [only] => only.clone(),
            _ => {
                self.set_phase(PreviewState::Validating);
                match self.validator.validate(&candidates).await {
                    Validation::Complete(report) => report
                        .selected
                        .unwrap_or_else(|| candidates[0].clone()),
                    Validation::Superseded => return Err(PreviewError::Cancelled),
                }
            }
        };

        if self.stopped_since(stops) {
            return Err(PreviewError::Cancelled);
        }
        if stored.as_ref() != Some(&chosen) {
            self.store_device(&chosen)?;
        }
        self.verified.store(true, Ordering::SeqCst);
        Ok(chosen)
    }

    /// Resolve a device and start previewing it. No-op while a preview is active.
    pub async fn start_preview(&self) -> Result<PathBuf, PreviewError> {
        if let Some(device) = self.supervisor.device() {
            return Ok(device);
        }
        let stops = self.stop_count();
        self.set_phase(PreviewState::Idle);

        let device = match self.resolve_device().await {
            Ok(device) => device,
            Err(PreviewError::Cancelled) => return Err(PreviewError::Cancelled),
            Err(err) => {
                self.set_phase(PreviewState::Error);
                return Err(err);
            }
        };

        if self.stopped_since(stops) {
            return Err(PreviewError::Cancelled);
        }

        self.set_phase(PreviewState::Previewing);
        if let Err(err) = self.supervisor.start(&device).await {
            self.set_phase(PreviewState::Error);
            return Err(err);
        }
        // A stop during the launch already discarded the session
        if self.stopped_since(stops) {
            return Err(PreviewError::Cancelled);
        }
        Ok(device)
    }

    pub fn stop_preview(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.supervisor.stop();
        self.set_phase(PreviewState::Stopped);
    }

    /// Persist `device` and switch the running preview to it
    pub async fn select_device(&self, device: &Path) -> Result<(), PreviewError> {
        self.store_device(device)?;
        self.verified.store(true, Ordering::SeqCst);

        if self.supervisor.is_active() {
            self.supervisor.stop();
            self.set_phase(PreviewState::Previewing);
            if let Err(err) = self.supervisor.start(device).await {
                self.set_phase(PreviewState::Error);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Working cameras with display names, sorted by path
    pub async fn refresh_device_list(&self) -> Result<Vec<CameraInfo>, PreviewError> {
        let candidates = self.enumerator.enumerate().await;
        let report = match self.validator.validate(&candidates).await {
            Validation::Complete(report) => report,
            Validation::Superseded => return Err(PreviewError::Cancelled),
        };
        if report.timed_out {
            warn!("device list may be incomplete");
        }

        let mut working: Vec<PathBuf> = report.working().map(|r| r.device.clone()).collect();
        working.sort();

        let mut cameras = Vec::with_capacity(working.len());
        for (index, device) in working.into_iter().enumerate() {
            let name = self.validator.probe().camera_name(&device, index).await;
            cameras.push(CameraInfo::new(device, name));
        }
        Ok(cameras)
    }

    /// Stop the preview, void any validation round and cancel pending commands
    pub fn shutdown(&self) {
        self.stop_preview();
        self.validator.invalidate();
        self.runner.cancel_all();
        info!("preview shut down");
    }

    pub async fn wait_for_cleanup(&self) {
        self.supervisor.wait_for_cleanup().await;
    }
}
