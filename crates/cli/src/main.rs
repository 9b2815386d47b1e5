//! CLI entry point for PeekCam
//!
//! Lists, probes and selects cameras, and runs the preview with frames logged
//! instead of drawn.

use clap::{Parser, Subcommand};
use peekcam::config::{JsonSettingsStore, SettingsStore};
use peekcam::{
    CapabilityProber, Config, DeviceProbe, DisplaySurface, ErrorReporter, PreviewController,
    PreviewState, ProcessRunner, UserMessage,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// PeekCam - live webcam preview with automatic camera discovery
#[derive(Parser, Debug)]
#[command(name = "peekcam")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: PathBuf,

    /// Path to the settings file holding the selected camera
    #[arg(short, long, default_value = "settings.json", global = true)]
    settings: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Discover and validate cameras, then print the working ones
    List {
        /// Print JSON instead of labels
        #[arg(long)]
        json: bool,
    },
    /// Run the capability cascade against one device
    Probe { device: PathBuf },
    /// Remember a device for the next preview
    Select { device: PathBuf },
    /// Run the preview until Ctrl-C
    Preview {
        /// Select this device before starting
        #[arg(short, long)]
        device: Option<PathBuf>,

        /// Stop after this many seconds
        #[arg(long)]
        seconds: Option<u64>,
    },
}

/// Logs frames instead of drawing them
struct LogSurface;

impl DisplaySurface for LogSurface {
    fn show_frame(&self, path: &Path, index: u64) {
        debug!(index, path = %path.display(), "frame");
    }

    fn resize(&self, width: u32, height: u32) {
        info!(width, height, "preview resized");
    }
}

struct StderrReporter;

impl ErrorReporter for StderrReporter {
    fn report(&self, message: &UserMessage) {
        eprintln!("{}: {}", message.title, message.detail);
        eprintln!("  {}", message.hint);
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = match Config::load_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {}: {}", args.config.display(), e);
            return ExitCode::FAILURE;
        }
    };
    let settings = match JsonSettingsStore::open(&args.settings) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("Failed to open {}: {}", args.settings.display(), e);
            return ExitCode::FAILURE;
        }
    };
    let runner = Arc::new(ProcessRunner::new());

    match args.command {
        Command::Probe { device } => {
            let prober = CapabilityProber::new(runner, config.probe.clone());
            let result = prober.probe(&device).await;
            println!(
                "{}: {} (stage {:?}, {} ms)",
                result.device.display(),
                if result.works { "works" } else { "not working" },
                result.stage,
                result.latency_ms
            );
            if result.works {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Command::Select { device } => {
            match settings.set(peekcam::config::CAMERA_DEVICE_KEY, &device.to_string_lossy()) {
                Ok(()) => {
                    println!(
                        "Selected {} (saved to {})",
                        device.display(),
                        settings.path().display()
                    );
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("Failed to store selection: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
        Command::List { json } => {
            let controller = build_controller(runner, &config, settings);
            let result = controller.refresh_device_list().await;
            controller.shutdown();
            match result {
                Ok(cameras) if json => match serde_json::to_string_pretty(&cameras) {
                    Ok(text) => {
                        println!("{}", text);
                        ExitCode::SUCCESS
                    }
                    Err(e) => {
                        eprintln!("Failed to encode device list: {}", e);
                        ExitCode::FAILURE
                    }
                },
                Ok(cameras) => {
                    if cameras.is_empty() {
                        println!("No working cameras found");
                    }
                    for camera in cameras {
                        println!("{}", camera.label);
                    }
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("Device discovery failed: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
        Command::Preview { device, seconds } => {
            let controller = build_controller(runner, &config, settings);
            let code = run_preview(&controller, device, seconds).await;
            controller.shutdown();
            controller.wait_for_cleanup().await;
            code
        }
    }
}

fn build_controller(
    runner: Arc<ProcessRunner>,
    config: &Config,
    settings: Arc<JsonSettingsStore>,
) -> PreviewController<ProcessRunner> {
    PreviewController::new(
        runner,
        config,
        settings,
        Arc::new(LogSurface),
        Arc::new(StderrReporter),
    )
}

async fn run_preview(
    controller: &PreviewController<ProcessRunner>,
    device: Option<PathBuf>,
    seconds: Option<u64>,
) -> ExitCode {
    if let Some(device) = device {
        if let Err(e) = controller.select_device(&device).await {
            eprintln!("Failed to select {}: {}", device.display(), e);
            return ExitCode::FAILURE;
        }
    }

    match controller.start_preview().await {
        Ok(device) => println!("Previewing {} (Ctrl-C to stop)", device.display()),
        Err(e) => {
            warn!(error = %e, "preview did not start");
            return ExitCode::FAILURE;
        }
    }

    let deadline = async {
        match seconds {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };
    let ended = async {
        let mut ticker = tokio::time::interval(Duration::from_millis(200));
        loop {
            ticker.tick().await;
            let state = controller.state();
            if matches!(state, PreviewState::Error | PreviewState::Idle) {
                return state;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            ExitCode::SUCCESS
        }
        _ = deadline => ExitCode::SUCCESS,
        state = ended => {
            warn!(state = state.as_str(), "preview ended");
            ExitCode::FAILURE
        }
    }
}
