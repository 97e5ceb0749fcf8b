/*!
 * Host Audio System
 *
 * Allocates capturers for configured devices and makes sure each device is
 * bound to at most one live capturer at a time.
 */

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use super::{AudioDevice, AudioSystemService, Capturer, CommandCapturer, DeviceBackend, SimulatedCapturer};
use crate::error::CaptureError;

type LeaseSet = Arc<Mutex<HashSet<String>>>;

/// Exclusive claim on a device, held by the capturer that owns it.
///
/// Released by [`DeviceLease::release`] or on drop, whichever comes first.
#[derive(Debug)]
pub struct DeviceLease {
    device_name: String,
    leases: LeaseSet,
    released: AtomicBool,
}

impl DeviceLease {
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        leases.remove(&self.device_name);
        debug!("Released lease on device {}", self.device_name);
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.release();
    }
}

/// [`AudioSystemService`] backed by this host's configured devices
#[derive(Debug, Clone, Default)]
pub struct HostAudioSystem {
    leases: LeaseSet,
}

impl HostAudioSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true while a capturer for `device_name` is open.
    pub fn is_leased(&self, device_name: &str) -> bool {
        self.leases
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(device_name)
    }

    fn acquire(&self, device: &AudioDevice) -> Result<DeviceLease, CaptureError> {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        if !leases.insert(device.name.clone()) {
            warn!("Device {} is already in use", device.name);
            return Err(CaptureError::device_unavailable(
                device,
                io::Error::new(io::ErrorKind::Other, "device is in use by another capture session"),
            ));
        }
        Ok(DeviceLease {
            device_name: device.name.clone(),
            leases: self.leases.clone(),
            released: AtomicBool::new(false),
        })
    }
}

impl AudioSystemService for HostAudioSystem {
    fn create_with_default_format(
        &self,
        device: &AudioDevice,
    ) -> Result<Box<dyn Capturer>, CaptureError> {
        let format = device.default_format();
        info!("Allocating capturer for {}", device);

        // Dropping the lease on any error path below frees the device again
        let lease = self.acquire(device)?;

        match &device.backend {
            DeviceBackend::Simulated { tone_hz } => Ok(Box::new(
                SimulatedCapturer::new(device.clone(), format, *tone_hz).with_lease(lease),
            )),
            DeviceBackend::Command { program, args } => {
                let capturer = CommandCapturer::spawn(device.clone(), format, program, args)
                    .map_err(|e| CaptureError::device_unavailable(device, e))?;
                Ok(Box::new(capturer.with_lease(lease)))
            }
        }
    }
}
