//! Device session: one camera from discovery to teardown.
//!
//! `DeviceSession` owns the SDK instance, the device list it produced and the
//! selected camera. Resources are released in reverse order of acquisition
//! (camera, then list, then instance) by `teardown`, which also runs on drop.
//!
//! State machine:
//!
//! ```text
//! Uninitialized -> Discovered -> Opened -> Configured <-> Acquiring
//!        \______________\___________\__________\____________\__> Closed
//! ```

use std::fmt;

use crate::error::SessionError;
use crate::sdk::{CameraDevice, CameraSystem, DeviceInfo, DeviceList};

/// Parameter selecting how many frames the camera streams.
pub const ACQUISITION_MODE_NODE: &str = "AcquisitionMode";
/// Entry of `AcquisitionMode` that streams until stopped.
pub const CONTINUOUS_ENTRY: &str = "Continuous";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Discovered,
    Opened,
    Configured,
    Acquiring,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Discovered => "discovered",
            SessionState::Opened => "opened",
            SessionState::Configured => "configured",
            SessionState::Acquiring => "acquiring",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

pub struct DeviceSession {
    system: Option<Box<dyn CameraSystem>>,
    devices: Option<Box<dyn DeviceList>>,
    camera: Option<Box<dyn CameraDevice>>,
    info: Option<DeviceInfo>,
    state: SessionState,
    valid: bool,
    opened: bool,
    setup_error: Option<SessionError>,
}

impl DeviceSession {
    /// Take ownership of an SDK instance, select the first camera, open it
    /// and set it to continuous acquisition.
    ///
    /// Never fails: when no camera is found the session is returned invalid
    /// and already closed. An open or configuration failure leaves the
    /// session valid but not configured, with the cause in `setup_error`.
    pub fn new(system: Box<dyn CameraSystem>) -> Self {
        let mut session = Self {
            system: Some(system),
            devices: None,
            camera: None,
            info: None,
            state: SessionState::Uninitialized,
            valid: false,
            opened: false,
            setup_error: None,
        };
        session.discover();
        session
    }

    fn discover(&mut self) {
        let enumerated = match self.system.as_mut() {
            Some(system) => system.enumerate().map(|list| (system.name(), list)),
            None => return,
        };
        let (backend, mut devices) = match enumerated {
            Ok(found) => found,
            Err(err) => {
                log::error!("DeviceSession: camera enumeration failed: {}", err);
                self.setup_error = Some(SessionError::Enumeration(err));
                self.teardown();
                return;
            }
        };

        let count = devices.len();
        log::info!("DeviceSession: {} camera(s) detected ({})", count, backend);
        if count == 0 {
            log::error!("DeviceSession: no camera found");
            self.devices = Some(devices);
            self.setup_error = Some(SessionError::NoDevice);
            self.teardown();
            return;
        }

        self.valid = true;
        self.state = SessionState::Discovered;
        let camera = devices.take(0);
        self.devices = Some(devices);
        let camera = match camera {
            Ok(camera) => camera,
            Err(err) => {
                log::error!("DeviceSession: failed to take camera 0: {}", err);
                self.setup_error = Some(SessionError::Open(err));
                return;
            }
        };
        let info = camera.info();
        log::info!(
            "DeviceSession: selected camera 0: {} {} (serial {})",
            info.vendor,
            info.model,
            info.serial
        );
        self.info = Some(info);
        self.camera = Some(camera);

        let setup = self.open().and_then(|()| self.configure());
        if let Err(err) = setup {
            log::error!("DeviceSession: camera setup failed: {}", err);
            self.setup_error = Some(err);
        }
    }

    fn open(&mut self) -> Result<(), SessionError> {
        let camera = self.camera.as_mut().ok_or(SessionError::InvalidState {
            operation: "open",
            state: self.state,
        })?;
        camera.init().map_err(SessionError::Open)?;
        self.opened = true;
        self.state = SessionState::Opened;
        Ok(())
    }

    /// Set `AcquisitionMode` to `Continuous`.
    ///
    /// The node must be available and writable, and its `Continuous` entry
    /// available and readable. On failure the session stays `Opened`.
    pub fn configure(&mut self) -> Result<(), SessionError> {
        self.ensure_valid()?;
        if !matches!(
            self.state,
            SessionState::Opened | SessionState::Configured
        ) {
            return Err(SessionError::InvalidState {
                operation: "configure",
                state: self.state,
            });
        }
        let camera = self.camera.as_mut().ok_or(SessionError::InvalidState {
            operation: "configure",
            state: self.state,
        })?;
        let nodes = camera.node_map();

        let mode = nodes
            .enum_node(ACQUISITION_MODE_NODE)
            .filter(|node| node.access.is_available() && node.access.is_writable())
            .ok_or_else(|| SessionError::Configuration {
                node: ACQUISITION_MODE_NODE.to_string(),
                reason: "node unavailable or not writable".to_string(),
            })?;
        let continuous = mode
            .entry(CONTINUOUS_ENTRY)
            .filter(|entry| entry.access.is_available() && entry.access.is_readable())
            .ok_or_else(|| SessionError::Configuration {
                node: format!("{}::{}", ACQUISITION_MODE_NODE, CONTINUOUS_ENTRY),
                reason: "entry unavailable or not readable".to_string(),
            })?;
        nodes
            .set_enum_value(ACQUISITION_MODE_NODE, continuous.value)
            .map_err(|err| SessionError::Configuration {
                node: ACQUISITION_MODE_NODE.to_string(),
                reason: err.to_string(),
            })?;

        log::info!("DeviceSession: acquisition mode set to continuous");
        self.state = SessionState::Configured;
        self.setup_error = None;
        Ok(())
    }

    /// True when enumeration found at least one camera.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Identity of the selected camera.
    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.info.as_ref()
    }

    /// Why the session did not reach `Configured` during construction.
    pub fn setup_error(&self) -> Option<&SessionError> {
        self.setup_error.as_ref()
    }

    /// Begin streaming. Only legal from `Configured`; a second call while
    /// acquiring is rejected.
    pub fn start_acquisition(&mut self) -> Result<(), SessionError> {
        self.ensure_valid()?;
        if self.state != SessionState::Configured {
            if let Some(err) = &self.setup_error {
                return Err(err.clone());
            }
            return Err(SessionError::InvalidState {
                operation: "start_acquisition",
                state: self.state,
            });
        }
        let camera = self.camera.as_mut().ok_or(SessionError::InvalidState {
            operation: "start_acquisition",
            state: self.state,
        })?;
        camera
            .begin_acquisition()
            .map_err(SessionError::Acquisition)?;
        log::info!("DeviceSession: acquiring images");
        self.state = SessionState::Acquiring;
        Ok(())
    }

    /// Stop streaming and return to `Configured`. The camera stays open.
    pub fn stop_acquisition(&mut self) -> Result<(), SessionError> {
        self.ensure_valid()?;
        if self.state != SessionState::Acquiring {
            return Err(SessionError::InvalidState {
                operation: "stop_acquisition",
                state: self.state,
            });
        }
        let camera = self.camera.as_mut().ok_or(SessionError::InvalidState {
            operation: "stop_acquisition",
            state: self.state,
        })?;
        camera.end_acquisition().map_err(SessionError::Acquisition)?;
        log::info!("DeviceSession: acquisition stopped");
        self.state = SessionState::Configured;
        Ok(())
    }

    /// The camera, while it is streaming.
    pub(crate) fn acquiring_camera(&mut self) -> Option<&mut (dyn CameraDevice + 'static)> {
        if self.state != SessionState::Acquiring {
            return None;
        }
        self.camera.as_deref_mut()
    }

    /// Release everything the session holds: end acquisition, deinitialize
    /// the camera, clear the device list, release the SDK instance.
    ///
    /// Safe to call repeatedly; each resource is released at most once.
    /// Errors are logged, never returned.
    pub fn teardown(&mut self) {
        let mut released = false;

        if let Some(mut camera) = self.camera.take() {
            if self.state == SessionState::Acquiring {
                if let Err(err) = camera.end_acquisition() {
                    log::warn!("DeviceSession: end acquisition failed: {}", err);
                }
            }
            if self.opened {
                if let Err(err) = camera.deinit() {
                    log::warn!("DeviceSession: camera deinit failed: {}", err);
                }
            }
            drop(camera);
            released = true;
        }
        self.opened = false;

        if let Some(mut devices) = self.devices.take() {
            if let Err(err) = devices.clear() {
                log::warn!("DeviceSession: clearing device list failed: {}", err);
            }
            released = true;
        }

        if let Some(mut system) = self.system.take() {
            if let Err(err) = system.release_instance() {
                log::warn!("DeviceSession: releasing {} instance failed: {}", system.name(), err);
            }
            released = true;
        }

        self.state = SessionState::Closed;
        if released {
            log::info!("DeviceSession: released all resources");
        }
    }

    fn ensure_valid(&self) -> Result<(), SessionError> {
        if self.valid {
            Ok(())
        } else {
            Err(SessionError::Invalid)
        }
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("state", &self.state)
            .field("valid", &self.valid)
            .field("device", &self.info)
            .finish()
    }
}
