//! Frame acquisition.
//!
//! `FrameAcquirer::pull` takes one frame from a streaming session:
//! 1. Requests the next raw frame from the camera (blocking, bounded by the
//!    grab timeout when one is configured)
//! 2. Discards incomplete frames, reporting the device's status text
//! 3. Converts complete frames to Mono8
//! 4. Returns the raw frame's pool slot and hands back an owned `Frame`
//!
//! Each raw frame is released exactly once before `pull` returns, whatever
//! the outcome. The pool discipline is one in, one out.
//!
//! `pull` borrows the session mutably, so two pulls can never overlap on the
//! same session.

use std::time::Duration;

use crate::error::AcquireError;
use crate::frame::Frame;
use crate::pixel::{self, ColorProcessing};
use crate::sdk::{CameraDevice, FrameStatus, RawFrame};
use crate::session::DeviceSession;

const DEFAULT_GRAB_TIMEOUT: Duration = Duration::from_millis(1000);

/// Configuration for a frame acquirer.
#[derive(Clone, Debug)]
pub struct AcquirerConfig {
    /// Upper bound on one blocking grab. `None` waits for the device forever.
    pub grab_timeout: Option<Duration>,
    /// Interpolation used when the native encoding is a color mosaic.
    pub color_processing: ColorProcessing,
}

impl Default for AcquirerConfig {
    fn default() -> Self {
        Self {
            grab_timeout: Some(DEFAULT_GRAB_TIMEOUT),
            color_processing: ColorProcessing::HqLinear,
        }
    }
}

/// Statistics for a frame acquirer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AcquirerStats {
    pub frames_delivered: u64,
    pub frames_incomplete: u64,
    pub device_errors: u64,
    pub conversion_errors: u64,
    /// Recoverable failures since the last delivered frame.
    pub consecutive_failures: u32,
}

pub struct FrameAcquirer {
    config: AcquirerConfig,
    stats: AcquirerStats,
}

impl FrameAcquirer {
    pub fn new(config: AcquirerConfig) -> Self {
        Self {
            config,
            stats: AcquirerStats::default(),
        }
    }

    pub fn config(&self) -> &AcquirerConfig {
        &self.config
    }

    pub fn stats(&self) -> AcquirerStats {
        self.stats.clone()
    }

    /// Pull the next frame from an acquiring session.
    ///
    /// Fails with `NotAcquiring` without touching the device when the
    /// session is in any other state.
    pub fn pull(&mut self, session: &mut DeviceSession) -> Result<Frame, AcquireError> {
        let state = session.state();
        let camera = session
            .acquiring_camera()
            .ok_or(AcquireError::NotAcquiring { state })?;

        let result = self.grab(camera);
        self.record(&result);
        result
    }

    fn grab(&self, camera: &mut dyn CameraDevice) -> Result<Frame, AcquireError> {
        let raw = camera.next_frame(self.config.grab_timeout)?;
        let lease = PoolLease::new(camera, raw);

        if let FrameStatus::Incomplete(status) = &lease.frame().status {
            let status = status.clone();
            lease.release();
            return Err(AcquireError::FrameIncomplete { status });
        }

        let raw = lease.frame();
        let (width, height, frame_id) = (raw.width, raw.height, raw.frame_id);
        let converted = pixel::convert_to_mono8(
            raw.data(),
            raw.width,
            raw.height,
            raw.stride,
            raw.pixel_format,
            self.config.color_processing,
        );
        lease.release();

        Ok(Frame::mono8(width, height, frame_id, converted?))
    }

    fn record(&mut self, result: &Result<Frame, AcquireError>) {
        match result {
            Ok(_) => {
                self.stats.frames_delivered += 1;
                self.stats.consecutive_failures = 0;
                return;
            }
            Err(AcquireError::FrameIncomplete { status }) => {
                log::warn!("FrameAcquirer: image incomplete: {}", status);
                self.stats.frames_incomplete += 1;
            }
            Err(AcquireError::Device(err)) => {
                log::warn!("FrameAcquirer: capture failed: {}", err);
                self.stats.device_errors += 1;
            }
            Err(AcquireError::Conversion(err)) => {
                log::warn!("FrameAcquirer: conversion failed: {}", err);
                self.stats.conversion_errors += 1;
            }
            Err(AcquireError::NotAcquiring { .. }) | Err(AcquireError::Broken { .. }) => return,
        }
        self.stats.consecutive_failures = self.stats.consecutive_failures.saturating_add(1);
    }
}

impl Default for FrameAcquirer {
    fn default() -> Self {
        Self::new(AcquirerConfig::default())
    }
}

/// A raw frame checked out of the device pool.
///
/// The slot goes back to the pool on `release`, or on drop if an early
/// return or a panic skipped the explicit release.
struct PoolLease<'a> {
    camera: &'a mut dyn CameraDevice,
    frame: RawFrame,
    released: bool,
}

impl<'a> PoolLease<'a> {
    fn new(camera: &'a mut dyn CameraDevice, frame: RawFrame) -> Self {
        Self {
            camera,
            frame,
            released: false,
        }
    }

    fn frame(&self) -> &RawFrame {
        &self.frame
    }

    fn release(mut self) {
        self.give_back();
    }

    fn give_back(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(err) = self.camera.release_frame(self.frame.slot) {
            log::warn!(
                "FrameAcquirer: releasing buffer {} failed: {}",
                self.frame.slot.0,
                err
            );
        }
    }
}

impl Drop for PoolLease<'_> {
    fn drop(&mut self) {
        self.give_back();
    }
}
