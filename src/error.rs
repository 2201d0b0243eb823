//! Error taxonomy shared by the session and the acquirer.
//!
//! Callers decide what to do from `kind()`, never from message text:
//! - `SetupFatal`: no camera, or the camera cannot be opened/configured.
//!   Abort startup.
//! - `Recoverable`: one frame was lost. Retry on the next pull.
//! - `Usage`: an operation was called in the wrong lifecycle state. This is a
//!   caller bug, not a device fault.
//! - `Broken`: too many consecutive recoverable failures. The session is
//!   abandoned.

use thiserror::Error;

use crate::pixel::ConversionError;
use crate::sdk::DeviceError;
use crate::session::SessionState;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    SetupFatal,
    Recoverable,
    Usage,
    Broken,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("no camera detected")]
    NoDevice,
    #[error("camera enumeration failed: {0}")]
    Enumeration(DeviceError),
    #[error("failed to open camera: {0}")]
    Open(DeviceError),
    #[error("unable to set {node}: {reason}")]
    Configuration { node: String, reason: String },
    #[error("acquisition control failed: {0}")]
    Acquisition(DeviceError),
    #[error("session is invalid: no camera was found")]
    Invalid,
    #[error("{operation} is not allowed while the session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::NoDevice
            | SessionError::Enumeration(_)
            | SessionError::Open(_)
            | SessionError::Configuration { .. }
            | SessionError::Acquisition(_) => ErrorKind::SetupFatal,
            SessionError::Invalid | SessionError::InvalidState { .. } => ErrorKind::Usage,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AcquireError {
    #[error("camera is not acquiring (session is {state}); call start_acquisition first")]
    NotAcquiring { state: SessionState },
    #[error("image incomplete: {status}")]
    FrameIncomplete { status: String },
    #[error("capture failed: {0}")]
    Device(#[from] DeviceError),
    #[error("mono8 conversion failed: {0}")]
    Conversion(#[from] ConversionError),
    #[error("giving up after {failures} consecutive failures; last: {last}")]
    Broken {
        failures: u32,
        last: Box<AcquireError>,
    },
}

impl AcquireError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AcquireError::NotAcquiring { .. } => ErrorKind::Usage,
            AcquireError::FrameIncomplete { .. }
            | AcquireError::Device(_)
            | AcquireError::Conversion(_) => ErrorKind::Recoverable,
            AcquireError::Broken { .. } => ErrorKind::Broken,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.kind() == ErrorKind::Recoverable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(SessionError::NoDevice.kind(), ErrorKind::SetupFatal);
        assert_eq!(
            SessionError::Configuration {
                node: "AcquisitionMode".to_string(),
                reason: "not writable".to_string()
            }
            .kind(),
            ErrorKind::SetupFatal
        );
        assert_eq!(SessionError::Invalid.kind(), ErrorKind::Usage);

        let not_acquiring = AcquireError::NotAcquiring {
            state: SessionState::Configured,
        };
        assert_eq!(not_acquiring.kind(), ErrorKind::Usage);
        assert!(!not_acquiring.is_recoverable());

        let timeout = AcquireError::from(DeviceError::timeout("no frame"));
        assert!(timeout.is_recoverable());

        let broken = AcquireError::Broken {
            failures: 3,
            last: Box::new(timeout),
        };
        assert_eq!(broken.kind(), ErrorKind::Broken);
    }

    #[test]
    fn messages_carry_device_status() {
        let err = AcquireError::FrameIncomplete {
            status: "data missing in image".to_string(),
        };
        assert_eq!(err.to_string(), "image incomplete: data missing in image");
    }
}
