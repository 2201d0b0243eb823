//! Synthetic camera SDK.
//!
//! `StubSystem` behaves like a vendor SDK with a configurable number of
//! attached cameras. It is used by the test suite and by `system = "stub"`.
//!
//! The stub is strict where real SDKs are strict:
//! - the buffer pool has `pool_size` slots and refuses grabs when all are held
//! - releasing a slot that is not outstanding is an error
//! - the system instance can be released once
//!
//! A `StubProbe` shares state with the system and every camera it produced,
//! recording lifecycle calls in order and counting frame acquire/release.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::{
    AccessMode, BufferSlot, CameraDevice, CameraSystem, DeviceError, DeviceErrorKind, DeviceInfo,
    DeviceList, EnumEntry, EnumNode, FrameStatus, NodeMap, RawFrame,
};
use crate::pixel::PixelFormat;
use crate::session::ACQUISITION_MODE_NODE as ACQUISITION_MODE;

const ROW_PADDING_BYTE: u8 = 0xAA;

/// Configuration for a synthetic SDK instance.
#[derive(Clone, Debug)]
pub struct StubConfig {
    /// Number of cameras reported by enumeration.
    pub devices: usize,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    /// Extra bytes at the end of every row.
    pub row_padding: usize,
    /// Number of frames that may be held unreleased at once.
    pub pool_size: usize,
    /// Access mode of the `AcquisitionMode` node.
    pub acquisition_mode_access: AccessMode,
    /// Access mode of the `Continuous` entry.
    pub continuous_access: AccessMode,
    /// Make `init` fail, as an unplugged or busy camera would.
    pub fail_init: bool,
}

impl Default for StubConfig {
    fn default() -> Self {
        Self {
            devices: 1,
            width: 640,
            height: 480,
            pixel_format: PixelFormat::BayerRG8,
            row_padding: 0,
            pool_size: 4,
            acquisition_mode_access: AccessMode::ReadWrite,
            continuous_access: AccessMode::ReadOnly,
            fail_init: false,
        }
    }
}

/// Outcome of one scripted grab. Unscripted grabs are `Complete`.
#[derive(Clone, Debug)]
pub enum StubGrab {
    Complete,
    Incomplete(String),
    Fail(DeviceError),
}

/// SDK calls recorded by the probe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StubEvent {
    Enumerate,
    Init,
    SetEnum { node: String, value: i64 },
    BeginAcquisition,
    EndAcquisition,
    Deinit,
    ListCleared,
    InstanceReleased,
}

#[derive(Debug, Default)]
struct ProbeState {
    events: Vec<StubEvent>,
    frames_acquired: u64,
    frames_released: u64,
    double_releases: u64,
    outstanding: HashSet<BufferSlot>,
}

/// Read-only view of what the stub SDK was asked to do.
#[derive(Clone, Debug, Default)]
pub struct StubProbe {
    state: Arc<Mutex<ProbeState>>,
}

impl StubProbe {
    fn with_state<T>(&self, f: impl FnOnce(&mut ProbeState) -> T) -> T {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    fn record(&self, event: StubEvent) {
        self.with_state(|state| state.events.push(event));
    }

    fn acquire(&self, slot: BufferSlot) {
        self.with_state(|state| {
            state.frames_acquired += 1;
            state.outstanding.insert(slot);
        });
    }

    fn release(&self, slot: BufferSlot) -> bool {
        self.with_state(|state| {
            if state.outstanding.remove(&slot) {
                state.frames_released += 1;
                true
            } else {
                state.double_releases += 1;
                false
            }
        })
    }

    /// Every recorded call, in order.
    pub fn events(&self) -> Vec<StubEvent> {
        self.with_state(|state| state.events.clone())
    }

    pub fn count(&self, event: &StubEvent) -> usize {
        self.with_state(|state| state.events.iter().filter(|e| *e == event).count())
    }

    pub fn frames_acquired(&self) -> u64 {
        self.with_state(|state| state.frames_acquired)
    }

    pub fn frames_released(&self) -> u64 {
        self.with_state(|state| state.frames_released)
    }

    /// Releases of slots that were not outstanding.
    pub fn double_releases(&self) -> u64 {
        self.with_state(|state| state.double_releases)
    }

    /// Frames handed out and not yet released.
    pub fn outstanding(&self) -> usize {
        self.with_state(|state| state.outstanding.len())
    }
}

// ----------------------------------------------------------------------------
// System
// ----------------------------------------------------------------------------

pub struct StubSystem {
    config: StubConfig,
    script: Arc<Mutex<VecDeque<StubGrab>>>,
    probe: StubProbe,
    released: bool,
}

impl StubSystem {
    pub fn new(config: StubConfig) -> Self {
        Self {
            config,
            script: Arc::new(Mutex::new(VecDeque::new())),
            probe: StubProbe::default(),
            released: false,
        }
    }

    /// Queue grab outcomes, consumed in order by `next_frame`.
    pub fn with_script(self, grabs: impl IntoIterator<Item = StubGrab>) -> Self {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(grabs);
        self
    }

    pub fn probe(&self) -> StubProbe {
        self.probe.clone()
    }
}

impl CameraSystem for StubSystem {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn enumerate(&mut self) -> Result<Box<dyn DeviceList>, DeviceError> {
        if self.released {
            return Err(DeviceError::invalid_handle(
                "system instance already released",
            ));
        }
        self.probe.record(StubEvent::Enumerate);
        let devices = (0..self.config.devices)
            .map(|index| {
                Some(StubCamera::new(
                    index,
                    self.config.clone(),
                    self.script.clone(),
                    self.probe.clone(),
                ))
            })
            .collect();
        Ok(Box::new(StubDeviceList {
            devices,
            probe: self.probe.clone(),
        }))
    }

    fn release_instance(&mut self) -> Result<(), DeviceError> {
        if self.released {
            return Err(DeviceError::invalid_handle(
                "system instance already released",
            ));
        }
        self.released = true;
        self.probe.record(StubEvent::InstanceReleased);
        Ok(())
    }
}

impl Drop for StubSystem {
    fn drop(&mut self) {
        if !self.released {
            log::warn!("StubSystem: dropped without release_instance");
        }
    }
}

struct StubDeviceList {
    devices: Vec<Option<StubCamera>>,
    probe: StubProbe,
}

impl DeviceList for StubDeviceList {
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
        self.probe.record(StubEvent::ListCleared);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Camera
// ----------------------------------------------------------------------------

pub struct StubCamera {
    index: usize,
    config: StubConfig,
    script: Arc<Mutex<VecDeque<StubGrab>>>,
    probe: StubProbe,
    nodes: StubNodeMap,
    initialized: bool,
    acquiring: bool,
    frame_count: u64,
}

impl StubCamera {
    fn new(
        index: usize,
        config: StubConfig,
        script: Arc<Mutex<VecDeque<StubGrab>>>,
        probe: StubProbe,
    ) -> Self {
        let nodes = StubNodeMap::new(&config, probe.clone());
        Self {
            index,
            config,
            script,
            probe,
            nodes,
            initialized: false,
            acquiring: false,
            frame_count: 0,
        }
    }

    fn next_grab(&self) -> StubGrab {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(StubGrab::Complete)
    }

    fn stride(&self) -> usize {
        self.config.pixel_format.min_stride(self.config.width) + self.config.row_padding
    }

    /// Diagonal gradient that shifts by one step per frame.
    fn render(&self) -> Vec<u8> {
        let width = self.config.width as usize;
        let height = self.config.height as usize;
        let stride = self.stride();
        let row_bytes = self.config.pixel_format.min_stride(self.config.width);
        let mut data = vec![ROW_PADDING_BYTE; stride * height];
        for y in 0..height {
            let row = &mut data[y * stride..y * stride + row_bytes];
            for x in 0..width {
                let value = ((x as u64 + y as u64 + self.frame_count) % 256) as u8;
                match self.config.pixel_format {
                    PixelFormat::Mono16 => {
                        row[2 * x] = 0;
                        row[2 * x + 1] = value;
                    }
                    PixelFormat::Yuyv => {
                        row[2 * x] = value;
                        row[2 * x + 1] = 128;
                    }
                    PixelFormat::Rgb8 => row[3 * x..3 * x + 3].fill(value),
                    _ => row[x] = value,
                }
            }
        }
        data
    }
}

impl CameraDevice for StubCamera {
    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            vendor: "Stub Imaging".to_string(),
            model: format!("Synthetic {}", self.config.pixel_format),
            serial: format!("STUB{:04}", self.index),
        }
    }

    fn init(&mut self) -> Result<(), DeviceError> {
        if self.config.fail_init {
            return Err(DeviceError::transport("camera did not respond to init"));
        }
        if self.initialized {
            return Err(DeviceError::invalid_handle("camera already initialized"));
        }
        self.initialized = true;
        self.probe.record(StubEvent::Init);
        Ok(())
    }

    fn deinit(&mut self) -> Result<(), DeviceError> {
        if !self.initialized {
            return Err(DeviceError::invalid_handle("camera not initialized"));
        }
        self.initialized = false;
        self.acquiring = false;
        self.probe.record(StubEvent::Deinit);
        Ok(())
    }

    fn node_map(&mut self) -> &mut dyn NodeMap {
        &mut self.nodes
    }

    fn begin_acquisition(&mut self) -> Result<(), DeviceError> {
        if !self.initialized {
            return Err(DeviceError::invalid_handle("camera not initialized"));
        }
        if self.acquiring {
            return Err(DeviceError::new(
                DeviceErrorKind::Other,
                "acquisition already running",
            ));
        }
        self.acquiring = true;
        self.probe.record(StubEvent::BeginAcquisition);
        Ok(())
    }

    fn end_acquisition(&mut self) -> Result<(), DeviceError> {
        if !self.acquiring {
            return Err(DeviceError::invalid_handle("acquisition not running"));
        }
        self.acquiring = false;
        self.probe.record(StubEvent::EndAcquisition);
        Ok(())
    }

    fn next_frame(&mut self, _timeout: Option<Duration>) -> Result<RawFrame, DeviceError> {
        if !self.acquiring {
            return Err(DeviceError::invalid_handle("acquisition not running"));
        }
        if self.probe.outstanding() >= self.config.pool_size {
            return Err(DeviceError::new(
                DeviceErrorKind::PoolExhausted,
                format!(
                    "all {} buffers are held by unreleased frames",
                    self.config.pool_size
                ),
            ));
        }
        let status = match self.next_grab() {
            StubGrab::Complete => FrameStatus::Complete,
            StubGrab::Incomplete(description) => FrameStatus::Incomplete(description),
            StubGrab::Fail(err) => return Err(err),
        };

        self.frame_count += 1;
        let slot = BufferSlot(self.frame_count);
        self.probe.acquire(slot);
        Ok(RawFrame::new(
            slot,
            self.frame_count,
            self.config.width,
            self.config.height,
            self.stride(),
            self.config.pixel_format,
            status,
            self.render(),
        ))
    }

    fn release_frame(&mut self, slot: BufferSlot) -> Result<(), DeviceError> {
        if self.probe.release(slot) {
            Ok(())
        } else {
            Err(DeviceError::invalid_handle(format!(
                "buffer {} is not outstanding",
                slot.0
            )))
        }
    }
}

struct StubNodeMap {
    acquisition_mode: EnumNode,
    value: i64,
    probe: StubProbe,
}

impl StubNodeMap {
    fn new(config: &StubConfig, probe: StubProbe) -> Self {
        let entry = |name: &str, value, access| EnumEntry {
            name: name.to_string(),
            value,
            access,
        };
        Self {
            acquisition_mode: EnumNode {
                name: ACQUISITION_MODE.to_string(),
                access: config.acquisition_mode_access,
                entries: vec![
                    entry("Continuous", 0, config.continuous_access),
                    entry("SingleFrame", 1, AccessMode::ReadOnly),
                    entry("MultiFrame", 2, AccessMode::ReadOnly),
                ],
            },
            value: 1,
            probe,
        }
    }
}

impl NodeMap for StubNodeMap {
    fn enum_node(&self, name: &str) -> Option<EnumNode> {
        if name == ACQUISITION_MODE && self.acquisition_mode.access.is_available() {
            Some(self.acquisition_mode.clone())
        } else {
            None
        }
    }

    fn set_enum_value(&mut self, name: &str, value: i64) -> Result<(), DeviceError> {
        if name != ACQUISITION_MODE || !self.acquisition_mode.access.is_available() {
            return Err(DeviceError::new(
                DeviceErrorKind::Other,
                format!("node {} not found", name),
            ));
        }
        if !self.acquisition_mode.access.is_writable() {
            return Err(DeviceError::new(
                DeviceErrorKind::AccessDenied,
                format!("node {} is not writable", name),
            ));
        }
        if !self.acquisition_mode.entries.iter().any(|e| e.value == value) {
            return Err(DeviceError::new(
                DeviceErrorKind::Other,
                format!("node {} has no entry with value {}", name, value),
            ));
        }
        self.value = value;
        self.probe.record(StubEvent::SetEnum {
            node: name.to_string(),
            value,
        });
        Ok(())
    }
}
