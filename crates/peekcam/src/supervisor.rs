//! Supervision of the external capture process.
//!
//! One session at a time: a working directory, the capture script running in
//! it, a poll task that forwards new frames to the display, and a startup
//! watchdog. Stopping tears all of it down without waiting for the process.

use crate::error::PreviewError;
use crate::markers::{
    find_newest_frame, read_error_marker, read_pid, read_resolution, CaptureFailure, FRAMES_DIR,
    SCRIPT_FILE,
};
use crate::pipeline::{
    negotiate_from_verbose_caps, negotiate_from_formats, negotiate_from_monitor,
    parse_format_sizes, Negotiated, PipelineConfig, Resolution,
};
use crate::runner::{CommandRunner, CommandSpec};
use crate::surface::{DisplaySurface, ErrorReporter};
use peekcam_config::{CaptureConfig, Config, ProbeConfig};
use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Budget for each step of process teardown
const TEARDOWN_STEP: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Starting,
    Running,
    Stopping,
    Erroring,
}

impl SupervisorState {
    pub fn as_str(&self) -> &str {
        match self {
            SupervisorState::Idle => "idle",
            SupervisorState::Starting => "starting",
            SupervisorState::Running => "running",
            SupervisorState::Stopping => "stopping",
            SupervisorState::Erroring => "erroring",
        }
    }
}

/// Result of one poll tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    /// The script wrote an error marker
    Failed(CaptureFailure),
    /// No frame has appeared yet
    Waiting,
    /// A newer frame was shown
    Shown(u64),
    /// Nothing newer than the last shown frame
    Unchanged,
}

/// Per-session view of the working directory
///
/// Applies the resolution marker once and forwards frames with strictly
/// increasing indices.
pub struct SessionPoller {
    work_dir: PathBuf,
    frames_dir: PathBuf,
    preview_width: u32,
    surface: Arc<dyn DisplaySurface>,
    resolution: Option<Resolution>,
    last_frame: Option<u64>,
}

impl SessionPoller {
    pub fn new(
        work_dir: PathBuf,
        frames_dir: PathBuf,
        preview_width: u32,
        surface: Arc<dyn DisplaySurface>,
    ) -> Self {
        Self {
            work_dir,
            frames_dir,
            preview_width,
            surface,
            resolution: None,
            last_frame: None,
        }
    }

    pub fn last_frame(&self) -> Option<u64> {
        self.last_frame
    }

    pub async fn tick(&mut self) -> Tick {
        if let Some(failure) = read_error_marker(&self.work_dir).await {
            return Tick::Failed(failure);
        }

        if self.resolution.is_none() {
            if let Some(camera) = read_resolution(&self.work_dir).await {
                let viewport = camera.fit_width(self.preview_width);
                debug!(camera = %camera, viewport = %viewport, "applying resolution");
                self.surface.resize(viewport.width, viewport.height);
                self.resolution = Some(camera);
            }
        }

        match find_newest_frame(&self.frames_dir).await {
            Some(frame) if self.last_frame.map_or(true, |last| frame.index > last) => {
                self.surface.show_frame(&frame.path, frame.index);
                self.last_frame = Some(frame.index);
                Tick::Shown(frame.index)
            }
            _ if self.last_frame.is_none() => Tick::Waiting,
            _ => Tick::Unchanged,
        }
    }
}

struct Session {
    device: PathBuf,
    work_dir: PathBuf,
    child: Option<Child>,
    poll: Option<AbortHandle>,
    startup: Option<AbortHandle>,
}

impl Session {
    fn abort_tasks(&mut self) {
        if let Some(poll) = self.poll.take() {
            poll.abort();
        }
        if let Some(startup) = self.startup.take() {
            startup.abort();
        }
    }
}

struct Shared {
    state: SupervisorState,
    /// Bumped on every start, stop and failure; stale tasks compare against it
    epoch: u64,
    device: Option<PathBuf>,
    session: Option<Session>,
    last_failure: Option<CaptureFailure>,
}

struct Inner<R> {
    runner: Arc<R>,
    capture: CaptureConfig,
    probe: ProbeConfig,
    surface: Arc<dyn DisplaySurface>,
    reporter: Arc<dyn ErrorReporter>,
    shared: Mutex<Shared>,
    cleanups: Mutex<Vec<JoinHandle<()>>>,
}

impl<R> Inner<R> {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.lock().epoch == epoch
    }
}

impl<R: CommandRunner> Inner<R> {
    async fn launch(self: &Arc<Self>, device: &Path, epoch: u64) -> Result<(), PreviewError> {
        if let Err(e) = tokio::fs::metadata(device).await {
            if e.kind() == std::io::ErrorKind::NotFound {
                return Err(CaptureFailure::DeviceNotFound.into());
            }
        }

        let negotiated = self.negotiate(device).await;
        if !self.is_current(epoch) {
            return Ok(());
        }

        let work_dir = self
            .capture
            .temp_root()
            .join(format!("peekcam-frames-{}", Uuid::new_v4()));
        let frames_dir = work_dir.join(FRAMES_DIR);
        tokio::fs::create_dir_all(&frames_dir).await?;

        let pipeline = PipelineConfig {
            device: device.to_path_buf(),
            work_dir: work_dir.clone(),
            frames_dir: frames_dir.clone(),
            negotiated,
            ring_size: self.capture.ring_size,
            jpeg_quality: self.capture.jpeg_quality,
            mirror: true,
        };
        let child = match spawn_capture(&pipeline).await {
            Ok(child) => child,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&work_dir).await;
                return Err(e);
            }
        };
        info!(
            device = %device.display(),
            work_dir = %work_dir.display(),
            caps = pipeline.negotiated.caps.as_deref().unwrap_or("auto"),
            "capture process started"
        );

        let mut session = Session {
            device: device.to_path_buf(),
            work_dir: work_dir.clone(),
            child: Some(child),
            poll: None,
            startup: None,
        };

        let mut shared = self.lock();
        if shared.epoch != epoch {
            drop(shared);
            debug!("start superseded before the session was installed");
            self.teardown(session);
            return Ok(());
        }

        let weak = Arc::downgrade(self);
        let poller = SessionPoller::new(
            work_dir.clone(),
            frames_dir,
            self.capture.preview_width,
            self.surface.clone(),
        );
        let poll = tokio::spawn(poll_session(
            weak.clone(),
            epoch,
            poller,
            self.capture.poll_interval(),
        ));
        let startup = tokio::spawn(watch_startup(
            weak,
            epoch,
            work_dir,
            self.capture.startup_timeout(),
        ));
        session.poll = Some(poll.abort_handle());
        session.startup = Some(startup.abort_handle());
        shared.session = Some(session);
        Ok(())
    }

    /// Pin caps from the device's format list, then the device monitor. Failing both,
    /// measure the aspect with one buffer through GStreamer, else leave caps open.
    async fn negotiate(&self, device: &Path) -> Negotiated {
        let width = self.capture.preview_width;

        let formats = self
            .runner
            .run(
                CommandSpec::new("v4l2-ctl")
                    .arg(format!("--device={}", device.display()))
                    .arg("--list-formats-ext"),
                self.probe.format_timeout(),
            )
            .await;
        if formats.success() {
            if let Some(n) = negotiate_from_formats(&parse_format_sizes(&formats.stdout), width) {
                return n;
            }
        }

        let monitor = self
            .runner
            .run(
                CommandSpec::new("gst-device-monitor-1.0").arg("Video/Source"),
                self.probe.detection_timeout(),
            )
            .await;
        if monitor.success() {
            if let Some(n) = negotiate_from_monitor(&monitor.stdout, device, width) {
                return n;
            }
        }

        let sample = self
            .runner
            .run(
                CommandSpec::new("gst-launch-1.0")
                    .arg("-v")
                    .arg("v4l2src")
                    .arg(format!("device={}", device.display()))
                    .arg("num-buffers=1")
                    .arg("!")
                    .arg("fakesink")
                    .verbose(),
                self.probe.format_timeout(),
            )
            .await;
        if let Some(n) = negotiate_from_verbose_caps(&sample.stdout, width)
            .or_else(|| negotiate_from_verbose_caps(&sample.stderr, width))
        {
            return n;
        }

        debug!(device = %device.display(), "no known size, leaving caps to GStreamer");
        Negotiated::automatic(width)
    }

    fn mark_running(&self, epoch: u64, index: u64) {
        let mut shared = self.lock();
        if shared.epoch != epoch || shared.state != SupervisorState::Starting {
            return;
        }
        shared.state = SupervisorState::Running;
        if let Some(startup) = shared.session.as_mut().and_then(|s| s.startup.take()) {
            startup.abort();
        }
        info!(index, "first frame received");
    }

    /// End the session with `failure`. Ignored for stale epochs.
    fn fail(&self, epoch: u64, failure: CaptureFailure, startup_only: bool) {
        let session = {
            let mut shared = self.lock();
            let applies = match shared.state {
                SupervisorState::Starting => true,
                SupervisorState::Running => !startup_only,
                _ => false,
            };
            if shared.epoch != epoch || !applies {
                return;
            }
            shared.state = SupervisorState::Erroring;
            shared.epoch += 1;
            shared.last_failure = Some(failure.clone());
            shared.session.take()
        };

        warn!(error = %failure, "preview failed");
        self.reporter.report(&failure.user_message());
        if let Some(session) = session {
            self.teardown(session);
        }

        let mut shared = self.lock();
        if shared.epoch == epoch + 1 {
            shared.state = SupervisorState::Idle;
        }
    }

    /// Cancel the session's tasks and clean up the process and directory in the background
    fn teardown(&self, mut session: Session) {
        session.abort_tasks();
        debug!(device = %session.device.display(), "tearing down capture session");
        let cleanup = tokio::spawn(cleanup_session(self.runner.clone(), session));

        let mut cleanups = self.cleanups.lock().unwrap_or_else(|e| e.into_inner());
        cleanups.retain(|handle| !handle.is_finished());
        cleanups.push(cleanup);
    }
}

async fn spawn_capture(pipeline: &PipelineConfig) -> Result<Child, PreviewError> {
    let script_path = pipeline.work_dir.join(SCRIPT_FILE);
    tokio::fs::write(&script_path, pipeline.script()).await?;
    tokio::fs::set_permissions(&script_path, Permissions::from_mode(0o755)).await?;

    Command::new("/bin/bash")
        .arg(&script_path)
        .current_dir(&pipeline.work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PreviewError::ToolMissing("/bin/bash".to_string())
            } else {
                PreviewError::Spawn {
                    command: format!("/bin/bash {}", script_path.display()),
                    message: e.to_string(),
                }
            }
        })
}

async fn poll_session<R: CommandRunner>(
    inner: Weak<Inner<R>>,
    epoch: u64,
    mut poller: SessionPoller,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let Some(supervisor) = inner.upgrade() else {
            return;
        };
        if !supervisor.is_current(epoch) {
            return;
        }
        match poller.tick().await {
            Tick::Failed(failure) => {
                supervisor.fail(epoch, failure, false);
                return;
            }
            Tick::Shown(index) => supervisor.mark_running(epoch, index),
            Tick::Waiting | Tick::Unchanged => {}
        }
    }
}

async fn watch_startup<R: CommandRunner>(
    inner: Weak<Inner<R>>,
    epoch: u64,
    work_dir: PathBuf,
    timeout: Duration,
) {
    tokio::time::sleep(timeout).await;
    let failure = read_error_marker(&work_dir)
        .await
        .unwrap_or(CaptureFailure::StartTimeout);
    if let Some(supervisor) = inner.upgrade() {
        supervisor.fail(epoch, failure, true);
    }
}

/// Kill the script's children, the script, then remove the working directory
async fn cleanup_session<R: CommandRunner>(runner: Arc<R>, mut session: Session) {
    let mut problems = Vec::new();

    if let Some(pid) = read_pid(&session.work_dir).await {
        let kill = CommandSpec::shell(format!(
            "pkill -P {pid} 2>/dev/null; kill {pid} 2>/dev/null; true"
        ));
        let output = runner.run(kill.clone(), TEARDOWN_STEP).await;
        if let Some(err) = output.error(&kill) {
            problems.push(err.to_string());
        }
    }

    if let Some(mut child) = session.child.take() {
        // Fails only if the process is already gone
        let _ = child.start_kill();
        if tokio::time::timeout(TEARDOWN_STEP, child.wait()).await.is_err() {
            problems.push("capture process did not exit".to_string());
        }
    }

    match tokio::fs::remove_dir_all(&session.work_dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => problems.push(format!("{}: {}", session.work_dir.display(), e)),
    }

    if !problems.is_empty() {
        let err = PreviewError::Cleanup(problems.join("; "));
        warn!(error = %err, "capture session cleanup");
    }
}

/// Owns at most one capture session
pub struct CaptureSupervisor<R: CommandRunner> {
    inner: Arc<Inner<R>>,
}

impl<R: CommandRunner> CaptureSupervisor<R> {
    pub fn new(
        runner: Arc<R>,
        config: &Config,
        surface: Arc<dyn DisplaySurface>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                runner,
                capture: config.capture.clone(),
                probe: config.probe.clone(),
                surface,
                reporter,
                shared: Mutex::new(Shared {
                    state: SupervisorState::Idle,
                    epoch: 0,
                    device: None,
                    session: None,
                    last_failure: None,
                }),
                cleanups: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.inner.lock().state
    }

    /// Starting or running
    pub fn is_active(&self) -> bool {
        matches!(
            self.state(),
            SupervisorState::Starting | SupervisorState::Running
        )
    }

    /// Device of the active session
    pub fn device(&self) -> Option<PathBuf> {
        let shared = self.inner.lock();
        match shared.state {
            SupervisorState::Starting | SupervisorState::Running => shared.device.clone(),
            _ => None,
        }
    }

    /// Failure that ended the most recent session, cleared on start
    pub fn last_failure(&self) -> Option<CaptureFailure> {
        self.inner.lock().last_failure.clone()
    }

    /// Start a session on `device`. No-op while one is starting or running.
    ///
    /// Failures are reported to the error reporter and returned.
    pub async fn start(&self, device: &Path) -> Result<(), PreviewError> {
        let epoch = {
            let mut shared = self.inner.lock();
            if matches!(
                shared.state,
                SupervisorState::Starting | SupervisorState::Running
            ) {
                debug!(state = shared.state.as_str(), "capture already active");
                return Ok(());
            }
            shared.epoch += 1;
            shared.state = SupervisorState::Starting;
            shared.device = Some(device.to_path_buf());
            shared.last_failure = None;
            shared.epoch
        };

        let err = match self.inner.launch(device, epoch).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        let current = {
            let mut shared = self.inner.lock();
            if shared.epoch == epoch {
                shared.state = SupervisorState::Idle;
                shared.last_failure = Some(err.failure());
                true
            } else {
                false
            }
        };
        if current {
            warn!(device = %device.display(), error = %err, "failed to start capture");
            self.inner.reporter.report(&err.user_message());
        }
        Err(err)
    }

    /// Stop the session, if any. Returns without waiting for the process to exit.
    pub fn stop(&self) {
        let session = {
            let mut shared = self.inner.lock();
            if shared.state == SupervisorState::Idle && shared.session.is_none() {
                return;
            }
            shared.state = SupervisorState::Stopping;
            shared.epoch += 1;
            shared.session.take()
        };

        if let Some(session) = session {
            self.inner.teardown(session);
        }
        self.inner.lock().state = SupervisorState::Idle;
    }

    /// Wait for background teardown of earlier sessions
    pub async fn wait_for_cleanup(&self) {
        let pending: Vec<JoinHandle<()>> = {
            let mut cleanups = self.inner.cleanups.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *cleanups)
        };
        for handle in pending {
            let _ = handle.await;
        }
    }
}

impl<R: CommandRunner> Drop for CaptureSupervisor<R> {
    fn drop(&mut self) {
        let Some(mut session) = self.inner.lock().session.take() else {
            return;
        };
        session.abort_tasks();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(cleanup_session(self.inner.runner.clone(), session));
            }
            // No runtime left to run the kill commands; the owned child is all we can reach
            Err(_) => {
                if let Some(child) = session.child.as_mut() {
                    let _ = child.start_kill();
                }
                let _ = std::fs::remove_dir_all(&session.work_dir);
            }
        }
    }
}
