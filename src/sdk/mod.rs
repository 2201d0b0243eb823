//! Camera SDK boundary.
//!
//! The session and the acquirer reach hardware only through these traits:
//! - `CameraSystem`: the process-wide SDK instance; enumerates devices
//! - `DeviceList`: one enumeration result, holding unopened device handles
//! - `CameraDevice`: one camera, its parameter map and its frame buffer pool
//! - `NodeMap`: named-parameter configuration interface of a device
//!
//! Backends:
//! - `stub`: in-process synthetic SDK (tests, `system = "stub"`)
//! - `v4l2`: local V4L2 devices (feature: ingest-v4l2)
//!
//! Every `RawFrame` returned by `CameraDevice::next_frame` occupies a slot of
//! the device's buffer pool until it is handed back with `release_frame`.

use anyhow::Result;
use std::time::Duration;
use thiserror::Error;

use crate::config::{CameraConfig, SystemKind};
use crate::pixel::PixelFormat;

pub mod stub;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

pub use stub::{StubConfig, StubEvent, StubGrab, StubProbe, StubSystem};
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2System;

// ----------------------------------------------------------------------------
// Errors
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceErrorKind {
    /// No frame arrived within the grab timeout.
    Timeout,
    /// Driver or bus failure while talking to the device.
    Transport,
    /// Every buffer pool slot is held by unreleased frames.
    PoolExhausted,
    /// The handle is closed, released, or not initialized for the call.
    InvalidHandle,
    /// A parameter was written without write access.
    AccessDenied,
    Other,
}

/// Error raised by an SDK call.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message} ({kind:?})")]
pub struct DeviceError {
    pub kind: DeviceErrorKind,
    pub message: String,
}

impl DeviceError {
    pub fn new(kind: DeviceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(DeviceErrorKind::Timeout, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(DeviceErrorKind::Transport, message)
    }

    pub fn invalid_handle(message: impl Into<String>) -> Self {
        Self::new(DeviceErrorKind::InvalidHandle, message)
    }
}

// ----------------------------------------------------------------------------
// Parameter map
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    NotAvailable,
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    pub fn is_available(self) -> bool {
        self != AccessMode::NotAvailable
    }

    pub fn is_readable(self) -> bool {
        matches!(self, AccessMode::ReadOnly | AccessMode::ReadWrite)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, AccessMode::WriteOnly | AccessMode::ReadWrite)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnumEntry {
    pub name: String,
    pub value: i64,
    pub access: AccessMode,
}

/// Snapshot of an enumeration node: its access mode and selectable entries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnumNode {
    pub name: String,
    pub access: AccessMode,
    pub entries: Vec<EnumEntry>,
}

impl EnumNode {
    pub fn entry(&self, name: &str) -> Option<&EnumEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }
}

pub trait NodeMap {
    /// Look up an enumeration node by name. `None` when the device does not
    /// expose it.
    fn enum_node(&self, name: &str) -> Option<EnumNode>;

    /// Write the integer value of an enumeration entry into the node.
    fn set_enum_value(&mut self, name: &str, value: i64) -> Result<(), DeviceError>;
}

// ----------------------------------------------------------------------------
// Frames
// ----------------------------------------------------------------------------

/// Identifies the buffer pool slot backing a `RawFrame`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferSlot(pub u64);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    Complete,
    /// Partial transfer or sensor fault, with the device's description.
    Incomplete(String),
}

/// One capture result in the sensor's native encoding.
///
/// There is no `Clone`: a raw frame stands for a pool slot, and the slot is
/// returned exactly once through `CameraDevice::release_frame`.
#[derive(Debug)]
pub struct RawFrame {
    pub slot: BufferSlot,
    pub frame_id: u64,
    pub width: u32,
    pub height: u32,
    /// Bytes per row in `data`, including padding.
    pub stride: usize,
    pub pixel_format: PixelFormat,
    pub status: FrameStatus,
    data: Vec<u8>,
}

impl RawFrame {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        slot: BufferSlot,
        frame_id: u64,
        width: u32,
        height: u32,
        stride: usize,
        pixel_format: PixelFormat,
        status: FrameStatus,
        data: Vec<u8>,
    ) -> Self {
        Self {
            slot,
            frame_id,
            width,
            height,
            stride,
            pixel_format,
            status,
            data,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_incomplete(&self) -> bool {
        matches!(self.status, FrameStatus::Incomplete(_))
    }
}

// ----------------------------------------------------------------------------
// Devices
// ----------------------------------------------------------------------------

/// Transport-layer identity of a device, read before it is opened.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub vendor: String,
    pub model: String,
    pub serial: String,
}

/// Process-wide SDK instance.
pub trait CameraSystem: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// List the devices currently attached.
    fn enumerate(&mut self) -> Result<Box<dyn DeviceList>, DeviceError>;

    /// Release the instance. Must be the last SDK call of the process.
    fn release_instance(&mut self) -> Result<(), DeviceError>;
}

pub trait DeviceList: Send {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hand out the device at `index`. Each index can be taken once.
    fn take(&mut self, index: usize) -> Result<Box<dyn CameraDevice>, DeviceError>;

    /// Drop every handle the list still holds.
    fn clear(&mut self) -> Result<(), DeviceError>;
}

pub trait CameraDevice: Send {
    fn info(&self) -> DeviceInfo;

    /// Open the device handle.
    fn init(&mut self) -> Result<(), DeviceError>;

    fn deinit(&mut self) -> Result<(), DeviceError>;

    fn node_map(&mut self) -> &mut dyn NodeMap;

    fn begin_acquisition(&mut self) -> Result<(), DeviceError>;

    fn end_acquisition(&mut self) -> Result<(), DeviceError>;

    /// Block until the next frame is available, the timeout elapses, or the
    /// device fails. `None` waits indefinitely.
    fn next_frame(&mut self, timeout: Option<Duration>) -> Result<RawFrame, DeviceError>;

    /// Return a frame's slot to the buffer pool.
    fn release_frame(&mut self, slot: BufferSlot) -> Result<(), DeviceError>;
}

/// Build the SDK instance selected by the configuration.
pub fn open_system(config: &CameraConfig) -> Result<Box<dyn CameraSystem>> {
    match config.system {
        SystemKind::Stub => Ok(Box::new(StubSystem::new(config.stub.clone()))),
        SystemKind::V4l2 => {
            #[cfg(feature = "ingest-v4l2")]
            {
                Ok(Box::new(V4l2System::new(config.v4l2.clone())))
            }
            #[cfg(not(feature = "ingest-v4l2"))]
            {
                anyhow::bail!("the v4l2 system requires the ingest-v4l2 feature")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_mode_checks() {
        assert!(!AccessMode::NotAvailable.is_available());
        assert!(AccessMode::ReadOnly.is_readable());
        assert!(!AccessMode::ReadOnly.is_writable());
        assert!(AccessMode::WriteOnly.is_writable());
        assert!(!AccessMode::WriteOnly.is_readable());
        assert!(AccessMode::ReadWrite.is_readable() && AccessMode::ReadWrite.is_writable());
    }

    #[test]
    fn enum_node_entry_lookup() {
        let node = EnumNode {
            name: "AcquisitionMode".to_string(),
            access: AccessMode::ReadWrite,
            entries: vec![EnumEntry {
                name: "Continuous".to_string(),
                value: 0,
                access: AccessMode::ReadOnly,
            }],
        };
        assert_eq!(node.entry("Continuous").map(|e| e.value), Some(0));
        assert!(node.entry("SingleFrame").is_none());
    }

    #[test]
    fn stub_system_is_the_default() -> Result<()> {
        let system = open_system(&CameraConfig::default())?;
        assert_eq!(system.name(), "stub");
        Ok(())
    }
}
