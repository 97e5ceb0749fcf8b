//! Error types for the capture path.
//!
//! [`CaptureError`] covers everything that can end a capture request early.
//! The conversion into [`tonic::Status`] is the single place where failures
//! are mapped onto externally visible status codes.

use std::io;

use tonic::Status;

/// Errors raised while allocating a capturer or running a capture session.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// The device could not be allocated (busy, disconnected, backend failure).
    #[error("failed to allocate AudioCapturer {device}")]
    DeviceUnavailable {
        /// Description of the device that failed.
        device: String,
        #[source]
        source: io::Error,
    },

    /// No capture device is configured. Indicates a deployment defect.
    #[error("no capture device configured")]
    NoCaptureDevice,

    /// A read from an already allocated device failed mid-session.
    #[error("{0}")]
    Io(#[from] io::Error),

    /// `start()` was called on a session that is already running.
    #[error("capture session already started")]
    AlreadyStarted,
}

impl CaptureError {
    /// Creates a device unavailable error for the given device description.
    pub fn device_unavailable(device: impl ToString, source: io::Error) -> Self {
        Self::DeviceUnavailable {
            device: device.to_string(),
            source,
        }
    }
}

/// Errors reported by an outbound chunk sink.
///
/// A sink error is never surfaced to the client: it means the client can no
/// longer be reached, and the session ends as stopped.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The client cancelled the call or disconnected.
    #[error("client is gone")]
    ClientGone,
}

impl From<&CaptureError> for Status {
    fn from(error: &CaptureError) -> Self {
        match error {
            CaptureError::DeviceUnavailable { device, .. } => {
                Status::unavailable(format!("Failed to allocate AudioCapturer {}", device))
            }
            CaptureError::NoCaptureDevice => Status::internal("Internal Configuration Error."),
            CaptureError::Io(e) => Status::internal(e.to_string()),
            CaptureError::AlreadyStarted => Status::internal(error.to_string()),
        }
    }
}

impl From<CaptureError> for Status {
    fn from(error: CaptureError) -> Self {
        Status::from(&error)
    }
}
