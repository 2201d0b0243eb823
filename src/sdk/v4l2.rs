//! V4L2 camera system.
//!
//! Exposes local `/dev/video*` capture devices through the SDK traits:
//! - Enumeration lists device nodes by index
//! - `init` opens the node and negotiates a capture format (GREY preferred)
//! - `begin_acquisition` starts an mmap stream, `end_acquisition` stops it
//! - `next_frame` copies the next driver buffer out of the stream
//!
//! V4L2 has no GenICam node map, so each camera carries a small synthetic one
//! holding only `AcquisitionMode`. Streaming is always continuous.

use anyhow::Context;
use ouroboros::self_referencing;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use super::{
    AccessMode, BufferSlot, CameraDevice, CameraSystem, DeviceError, DeviceErrorKind, DeviceInfo,
    DeviceList, EnumEntry, EnumNode, FrameStatus, NodeMap, RawFrame,
};
use crate::config::V4l2Settings;
use crate::pixel::PixelFormat;
use crate::session::{ACQUISITION_MODE_NODE, CONTINUOUS_ENTRY};

const BUFFER_COUNT: u32 = 4;

pub struct V4l2System {
    settings: V4l2Settings,
    released: bool,
}

impl V4l2System {
    pub fn new(settings: V4l2Settings) -> Self {
        Self {
            settings,
            released: false,
        }
    }
}

impl CameraSystem for V4l2System {
    fn name(&self) -> &'static str {
        "v4l2"
    }

    fn enumerate(&mut self) -> Result<Box<dyn DeviceList>, DeviceError> {
        if self.released {
            return Err(DeviceError::invalid_handle(
                "system instance already released",
            ));
        }
        let mut nodes = v4l::context::enum_devices();
        nodes.sort_by_key(|node| node.index());
        let devices: Vec<_> = nodes
            .into_iter()
            .map(|node| {
                Some(V4l2Camera::new(
                    node.path().to_path_buf(),
                    node.name().unwrap_or_default(),
                    self.settings.clone(),
                ))
            })
            .collect();
        log::info!("V4l2System: found {} capture device(s)", devices.len());
        Ok(Box::new(V4l2DeviceList { devices }))
    }

    fn release_instance(&mut self) -> Result<(), DeviceError> {
        if self.released {
            return Err(DeviceError::invalid_handle(
                "system instance already released",
            ));
        }
        self.released = true;
        Ok(())
    }
}

struct V4l2DeviceList {
    devices: Vec<Option<V4l2Camera>>,
}

impl DeviceList for V4l2DeviceList {
    fn len(&self) -> usize {
        self.devices.len()
    }

    fn take(&mut self, index: usize) -> Result<Box<dyn CameraDevice>, DeviceError> {
        let slot = self
            .devices
            .get_mut(index)
            .ok_or_else(|| DeviceError::invalid_handle(format!("no device at index {}", index)))?;
        let camera = slot.take().ok_or_else(|| {
            DeviceError::invalid_handle(format!("device {} already taken", index))
        })?;
        Ok(Box::new(camera))
    }

    fn clear(&mut self) -> Result<(), DeviceError> {
        self.devices.clear();
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Camera
// ----------------------------------------------------------------------------

#[self_referencing]
struct StreamState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

enum DeviceState {
    Closed,
    Idle(v4l::Device),
    Streaming(StreamState),
}

/// Negotiated capture format.
#[derive(Clone, Copy, Debug)]
struct ActiveFormat {
    width: u32,
    height: u32,
    stride: usize,
    pixel_format: PixelFormat,
}

impl ActiveFormat {
    fn frame_bytes(&self) -> usize {
        self.stride * self.height as usize
    }
}

pub struct V4l2Camera {
    path: PathBuf,
    card: String,
    settings: V4l2Settings,
    state: DeviceState,
    format: Option<ActiveFormat>,
    nodes: V4l2NodeMap,
    timeout: Option<Duration>,
    frame_count: u64,
    outstanding: Vec<BufferSlot>,
}

impl V4l2Camera {
    fn new(path: PathBuf, card: String, settings: V4l2Settings) -> Self {
        Self {
            path,
            card,
            settings,
            state: DeviceState::Closed,
            format: None,
            nodes: V4l2NodeMap::new(),
            timeout: None,
            frame_count: 0,
            outstanding: Vec::new(),
        }
    }

    fn negotiate(&self, device: &v4l::Device) -> anyhow::Result<ActiveFormat> {
        use v4l::video::Capture;

        let mut format = device.format().context("read v4l2 format")?;
        format.width = self.settings.width;
        format.height = self.settings.height;
        format.fourcc = v4l::FourCC::new(b"GREY");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Camera: failed to set format on {}: {}",
                    self.path.display(),
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };

        let pixel_format = pixel_format_for(&format.fourcc.repr).with_context(|| {
            format!("unsupported v4l2 pixel format {}", format.fourcc)
        })?;
        let stride = (format.stride as usize).max(pixel_format.min_stride(format.width));
        Ok(ActiveFormat {
            width: format.width,
            height: format.height,
            stride,
            pixel_format,
        })
    }
}

fn pixel_format_for(fourcc: &[u8; 4]) -> Option<PixelFormat> {
    match fourcc {
        b"GREY" => Some(PixelFormat::Mono8),
        b"Y16 " => Some(PixelFormat::Mono16),
        b"YUYV" => Some(PixelFormat::Yuyv),
        b"RGB3" => Some(PixelFormat::Rgb8),
        b"RGGB" => Some(PixelFormat::BayerRG8),
        b"GRBG" => Some(PixelFormat::BayerGR8),
        b"GBRG" => Some(PixelFormat::BayerGB8),
        b"BA81" => Some(PixelFormat::BayerBG8),
        _ => None,
    }
}

fn io_error(context: &str, err: io::Error) -> DeviceError {
    let kind = match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => DeviceErrorKind::Timeout,
        io::ErrorKind::PermissionDenied => DeviceErrorKind::AccessDenied,
        _ => DeviceErrorKind::Transport,
    };
    DeviceError::new(kind, format!("{}: {}", context, err))
}

impl CameraDevice for V4l2Camera {
    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            vendor: "V4L2".to_string(),
            model: self.card.clone(),
            serial: self.path.display().to_string(),
        }
    }

    fn init(&mut self) -> Result<(), DeviceError> {
        if !matches!(self.state, DeviceState::Closed) {
            return Err(DeviceError::invalid_handle("camera already initialized"));
        }
        let device = v4l::Device::with_path(&self.path)
            .map_err(|err| io_error(&format!("open {}", self.path.display()), err))?;
        let format = self
            .negotiate(&device)
            .map_err(|err| DeviceError::new(DeviceErrorKind::Other, format!("{:#}", err)))?;
        log::info!(
            "V4l2Camera: opened {} ({}x{} {})",
            self.path.display(),
            format.width,
            format.height,
            format.pixel_format
        );
        self.format = Some(format);
        self.state = DeviceState::Idle(device);
        Ok(())
    }

    fn deinit(&mut self) -> Result<(), DeviceError> {
        if matches!(self.state, DeviceState::Closed) {
            return Err(DeviceError::invalid_handle("camera not initialized"));
        }
        // Dropping a stream stops it.
        self.state = DeviceState::Closed;
        self.format = None;
        self.outstanding.clear();
        Ok(())
    }

    fn node_map(&mut self) -> &mut dyn NodeMap {
        &mut self.nodes
    }

    fn begin_acquisition(&mut self) -> Result<(), DeviceError> {
        let device = match std::mem::replace(&mut self.state, DeviceState::Closed) {
            DeviceState::Idle(device) => device,
            other => {
                self.state = other;
                return Err(DeviceError::invalid_handle(
                    "camera must be initialized and idle",
                ));
            }
        };
        let built = StreamStateTryBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(
                    device,
                    v4l::buffer::Type::VideoCapture,
                    BUFFER_COUNT,
                )
            },
        }
        .try_build_or_recover();
        match built {
            Ok(stream) => {
                self.state = DeviceState::Streaming(stream);
                self.timeout = None;
                Ok(())
            }
            Err((err, heads)) => {
                self.state = DeviceState::Idle(heads.device);
                Err(io_error("create v4l2 buffer stream", err))
            }
        }
    }

    fn end_acquisition(&mut self) -> Result<(), DeviceError> {
        match std::mem::replace(&mut self.state, DeviceState::Closed) {
            DeviceState::Streaming(stream) => {
                let heads = stream.into_heads();
                self.state = DeviceState::Idle(heads.device);
                self.outstanding.clear();
                Ok(())
            }
            other => {
                self.state = other;
                Err(DeviceError::invalid_handle("acquisition not running"))
            }
        }
    }

    fn next_frame(&mut self, timeout: Option<Duration>) -> Result<RawFrame, DeviceError> {
        use v4l::io::traits::CaptureStream;

        let (DeviceState::Streaming(stream), Some(format)) = (&mut self.state, self.format)
        else {
            return Err(DeviceError::invalid_handle("acquisition not running"));
        };
        if self.outstanding.len() >= BUFFER_COUNT as usize {
            return Err(DeviceError::new(
                DeviceErrorKind::PoolExhausted,
                format!("all {} buffers are held by unreleased frames", BUFFER_COUNT),
            ));
        }
        // The handle keeps the last timeout; an unbounded grab after a bounded
        // one still waits at most that long.
        if let Some(timeout) = timeout {
            if self.timeout != Some(timeout) {
                stream.with_stream_mut(|stream| stream.set_timeout(timeout));
                self.timeout = Some(timeout);
            }
        }

        let (data, bytesused, driver_error) = stream
            .with_stream_mut(|stream| {
                stream.next().map(|(buf, meta)| {
                    let used = match meta.bytesused as usize {
                        0 => buf.len(),
                        used => used.min(buf.len()),
                    };
                    (
                        buf[..used].to_vec(),
                        used,
                        meta.flags.contains(v4l::buffer::Flags::ERROR),
                    )
                })
            })
            .map_err(|err| io_error("capture v4l2 frame", err))?;

        let status = if driver_error {
            FrameStatus::Incomplete("driver flagged the buffer as corrupted".to_string())
        } else if bytesused < format.frame_bytes() {
            FrameStatus::Incomplete(format!(
                "short payload: {} of {} bytes",
                bytesused,
                format.frame_bytes()
            ))
        } else {
            FrameStatus::Complete
        };

        self.frame_count += 1;
        let slot = BufferSlot(self.frame_count);
        self.outstanding.push(slot);
        Ok(RawFrame::new(
            slot,
            self.frame_count,
            format.width,
            format.height,
            format.stride,
            format.pixel_format,
            status,
            data,
        ))
    }

    fn release_frame(&mut self, slot: BufferSlot) -> Result<(), DeviceError> {
        let index = self
            .outstanding
            .iter()
            .position(|held| *held == slot)
            .ok_or_else(|| {
                DeviceError::invalid_handle(format!("buffer {} is not outstanding", slot.0))
            })?;
        self.outstanding.swap_remove(index);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Node map
// ----------------------------------------------------------------------------

struct V4l2NodeMap {
    acquisition_mode: EnumNode,
    value: i64,
}

impl V4l2NodeMap {
    fn new() -> Self {
        let entry = |name: &str, value| EnumEntry {
            name: name.to_string(),
            value,
            access: AccessMode::ReadOnly,
        };
        Self {
            acquisition_mode: EnumNode {
                name: ACQUISITION_MODE_NODE.to_string(),
                access: AccessMode::ReadWrite,
                entries: vec![entry(CONTINUOUS_ENTRY, 0), entry("SingleFrame", 1)],
            },
            value: 0,
        }
    }
}

impl NodeMap for V4l2NodeMap {
    fn enum_node(&self, name: &str) -> Option<EnumNode> {
        (name == ACQUISITION_MODE_NODE).then(|| self.acquisition_mode.clone())
    }

    fn set_enum_value(&mut self, name: &str, value: i64) -> Result<(), DeviceError> {
        if name != ACQUISITION_MODE_NODE {
            return Err(DeviceError::new(
                DeviceErrorKind::Other,
                format!("node {} not found", name),
            ));
        }
        if !self.acquisition_mode.entries.iter().any(|e| e.value == value) {
            return Err(DeviceError::new(
                DeviceErrorKind::Other,
                format!("node {} has no entry with value {}", name, value),
            ));
        }
        if value != 0 {
            log::warn!("V4l2Camera: only continuous streaming is supported; mode {} ignored", value);
        }
        self.value = value;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_fourccs() {
        assert_eq!(pixel_format_for(b"GREY"), Some(PixelFormat::Mono8));
        assert_eq!(pixel_format_for(b"RGGB"), Some(PixelFormat::BayerRG8));
        assert_eq!(pixel_format_for(b"YUYV"), Some(PixelFormat::Yuyv));
        assert_eq!(pixel_format_for(b"MJPG"), None);
    }

    #[test]
    fn node_map_accepts_continuous() -> Result<(), DeviceError> {
        let mut nodes = V4l2NodeMap::new();
        let node = nodes
            .enum_node(ACQUISITION_MODE_NODE)
            .expect("acquisition mode node");
        let continuous = node.entry(CONTINUOUS_ENTRY).expect("continuous entry");
        assert!(node.access.is_writable());
        assert!(continuous.access.is_readable());
        nodes.set_enum_value(ACQUISITION_MODE_NODE, continuous.value)?;
        assert!(nodes.set_enum_value(ACQUISITION_MODE_NODE, 7).is_err());
        assert!(nodes.enum_node("ExposureAuto").is_none());
        Ok(())
    }

    #[test]
    fn timeouts_map_to_recoverable_kind() {
        let err = io_error("capture", io::Error::new(io::ErrorKind::TimedOut, "poll"));
        assert_eq!(err.kind, DeviceErrorKind::Timeout);
    }

    #[test]
    fn camera_is_closed_until_init() {
        let mut camera = V4l2Camera::new(
            PathBuf::from("/dev/video-missing"),
            "test".to_string(),
            V4l2Settings::default(),
        );
        assert!(camera.begin_acquisition().is_err());
        assert!(camera.next_frame(None).is_err());
        assert!(camera.deinit().is_err());
        assert_eq!(camera.info().serial, "/dev/video-missing");
    }
}
