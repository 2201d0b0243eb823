//! Polar camera acquisition
//!
//! This crate owns the lifecycle of one machine-vision camera and turns its
//! captures into owned Mono8 frames for a host that publishes them at a fixed
//! rate.
//!
//! # Architecture
//!
//! 1. **Discover and configure**: `DeviceSession` enumerates cameras through
//!    the SDK boundary, opens the first one and switches it to continuous
//!    acquisition.
//! 2. **Pull**: `FrameAcquirer` takes one frame per call, drops incomplete
//!    captures, converts to Mono8 and returns the SDK buffer to its pool.
//! 3. **Run**: `AcquisitionWorker` pulls on its own thread; the host
//!    publishes to a `FrameSink` paced by a `Rate`.
//! 4. **Tear down**: in reverse order of acquisition, exactly once, from
//!    whichever owner drops the session last.
//!
//! # Module Structure
//!
//! - `sdk`: camera SDK traits plus the stub and V4L2 backends
//! - `session`: device lifecycle state machine
//! - `acquire`: frame pulls and buffer-pool discipline
//! - `pixel`: native encodings and Mono8 conversion
//! - `frame`: caller-owned output frames
//! - `worker`: background acquisition and cooperative shutdown
//! - `host`: sinks, rate limiting and the publish loop
//! - `config`: file and environment configuration
//! - `error`: error taxonomy

pub mod acquire;
pub mod config;
pub mod error;
pub mod frame;
pub mod host;
pub mod pixel;
pub mod sdk;
pub mod session;
pub mod worker;

pub use acquire::{AcquirerConfig, AcquirerStats, FrameAcquirer};
pub use config::{CameraConfig, SystemKind};
pub use error::{AcquireError, ErrorKind, SessionError};
pub use frame::Frame;
pub use host::{publish_loop, FrameSink, LogSink, LoopExit, LoopOutcome, Rate};
pub use pixel::{convert_to_mono8, ColorProcessing, ConversionError, PixelFormat};
pub use sdk::{open_system, CameraDevice, CameraSystem, DeviceError, DeviceInfo, DeviceList};
pub use session::{DeviceSession, SessionState};
pub use worker::{AcquisitionWorker, Delivery, StopSignal, WorkerConfig, WorkerExit, WorkerSummary};
