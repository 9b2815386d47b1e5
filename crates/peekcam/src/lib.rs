//! PeekCam core
//!
//! Camera discovery, validation and live frame supervision for the preview widget.

pub mod enumerate;
pub mod error;
pub mod markers;
pub mod pipeline;
pub mod preview;
pub mod probe;
pub mod runner;
pub mod supervisor;
pub mod surface;
pub mod validate;

#[cfg(test)]
mod testing;

pub use peekcam_config as config;
pub use peekcam_config::Config;
pub use enumerate::{DeviceCandidate, DeviceEnumerator, Strategy};
pub use error::PreviewError;
pub use markers::CaptureFailure;
pub use pipeline::{Negotiated, PipelineConfig, Resolution};
pub use preview::{PreviewController, PreviewState};
pub use probe::{CameraInfo, CapabilityProber, DeviceProbe, ProbeResult, ProbeStage};
pub use runner::{CommandOutcome, CommandOutput, CommandRunner, CommandSpec, ProcessRunner};
pub use supervisor::{CaptureSupervisor, SessionPoller, SupervisorState, Tick};
pub use surface::{DisplaySurface, ErrorReporter, UserMessage};
pub use validate::{ParallelValidator, Validation, ValidationReport};
