//! polar_camera - polar camera acquisition node
//!
//! This daemon:
//! 1. Opens the first camera reported by the configured SDK backend
//! 2. Switches it to continuous acquisition and starts streaming
//! 3. Pulls Mono8 frames on a worker thread
//! 4. Publishes them to the configured topic at a fixed rate
//! 5. Tears the camera down on Ctrl-C, on a broken stream, or after
//!    `--max-frames`
//!
//! Exit status: 0 after a clean shutdown, -1 when no camera is attached,
//! 1 on any other failure.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use polar_camera::{
    open_system, publish_loop, AcquisitionWorker, CameraConfig, DeviceSession, FrameAcquirer,
    LogSink, LoopExit, Rate, SessionError, StopSignal, SystemKind,
};

const EXIT_OK: i32 = 0;
const EXIT_NO_DEVICE: i32 = -1;
const EXIT_FAILURE: i32 = 1;

#[derive(Parser, Debug)]
#[command(author, version, about = "Acquire and publish polar camera frames")]
struct Args {
    /// JSON or TOML configuration file.
    #[arg(long, env = "POLAR_CAMERA_CONFIG")]
    config: Option<PathBuf>,

    /// Camera SDK backend (stub or v4l2). Overrides the config file.
    #[arg(long)]
    system: Option<SystemKind>,

    /// Topic frames are published under.
    #[arg(long)]
    topic: Option<String>,

    /// Publish rate in Hz.
    #[arg(long)]
    rate_hz: Option<u32>,

    /// Stop after publishing this many frames.
    #[arg(long)]
    max_frames: Option<u64>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    // Everything owned by `run` is dropped before the process exits.
    let code = match run(args) {
        Ok(code) => code,
        Err(err) => {
            log::error!("polar_camera: {:#}", err);
            EXIT_FAILURE
        }
    };
    std::process::exit(code);
}

fn run(args: Args) -> Result<i32> {
    let mut cfg = CameraConfig::load_from(args.config.as_deref())?;
    if let Some(system) = args.system {
        cfg.system = system;
    }
    if let Some(topic) = args.topic {
        cfg.topic = topic;
    }
    if let Some(rate_hz) = args.rate_hz {
        cfg.publish_rate_hz = rate_hz;
    }
    cfg.validate()?;

    let stop = StopSignal::new();
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || handler_stop.trigger()).context("error setting Ctrl-C handler")?;

    let system = open_system(&cfg)?;
    log::info!("polar_camera: using {} camera system", system.name());

    let mut session = DeviceSession::new(system);
    if let Some(err) = session.setup_error() {
        log::error!("polar_camera: {}", err);
        return Ok(match err {
            SessionError::NoDevice => EXIT_NO_DEVICE,
            _ => EXIT_FAILURE,
        });
    }
    if let Some(info) = session.device_info() {
        log::info!(
            "polar_camera: camera {} {} (serial {})",
            info.vendor,
            info.model,
            info.serial
        );
    }

    session
        .start_acquisition()
        .context("failed to start acquisition")?;
    let worker = AcquisitionWorker::spawn(
        session,
        FrameAcquirer::new(cfg.acquirer()),
        cfg.worker(),
        stop.clone(),
    )?;

    let mut sink = LogSink::new(cfg.topic.clone());
    let mut rate = Rate::from_hz(cfg.publish_rate_hz)?;
    log::info!(
        "polar_camera: publishing on {} at {} Hz (Ctrl-C to stop)",
        cfg.topic,
        cfg.publish_rate_hz
    );

    let outcome = publish_loop(&worker, &mut sink, &mut rate, &stop, args.max_frames);
    let summary = worker.stop()?;
    let outcome = outcome?;

    log::info!(
        "polar_camera: published {} frames, skipped {}, {} rate overruns",
        outcome.published,
        outcome.skipped,
        rate.overruns()
    );
    log::info!(
        "polar_camera: acquirer delivered {}, incomplete {}, device errors {}, conversion errors {} (worker {:?})",
        summary.stats.frames_delivered,
        summary.stats.frames_incomplete,
        summary.stats.device_errors,
        summary.stats.conversion_errors,
        summary.exit
    );

    match outcome.exit {
        LoopExit::Failed(err) => {
            log::error!("polar_camera: acquisition failed: {}", err);
            Ok(EXIT_FAILURE)
        }
        LoopExit::Stopped | LoopExit::FrameLimit | LoopExit::WorkerFinished => Ok(EXIT_OK),
    }
}
