//! Host configuration validation.
//!
//! Checks capture device descriptors and server limits before the service
//! starts, with descriptive error messages for the operator.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::audio::{AudioDevice, AudioFormat, DeviceBackend};

/// Supported sample rate range in Hz (inclusive).
pub const SAMPLE_RATE_RANGE: (u32, u32) = (8_000, 192_000);

/// Largest supported channel count.
pub const MAX_CHANNELS: u32 = 8;

/// Validates a device name used as the device's identity on this host.
pub fn validate_device_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        bail!("Device name cannot be empty");
    }
    if name.len() > 128 {
        bail!("Device name is too long: {} characters (max: 128)", name.len());
    }
    Ok(())
}

/// Ensures a format can be captured and streamed.
pub fn validate_format(format: &AudioFormat) -> Result<()> {
    let (min_rate, max_rate) = SAMPLE_RATE_RANGE;
    if format.sample_rate < min_rate || format.sample_rate > max_rate {
        bail!(
            "Sample rate {}Hz is out of range ({}Hz - {}Hz)",
            format.sample_rate,
            min_rate,
            max_rate
        );
    }
    if format.channels == 0 || format.channels > MAX_CHANNELS {
        bail!(
            "Channel count {} is out of range (1 - {})",
            format.channels,
            MAX_CHANNELS
        );
    }
    Ok(())
}

/// Validates a single capture device descriptor.
pub fn validate_device(device: &AudioDevice) -> Result<()> {
    validate_device_name(&device.name)?;
    validate_format(&device.default_format())
        .with_context(|| format!("Invalid format for device {}", device.name))?;

    match &device.backend {
        DeviceBackend::Simulated { tone_hz } => {
            let nyquist = device.default_format().sample_rate as f32 / 2.0;
            if !tone_hz.is_finite() || *tone_hz < 0.0 || *tone_hz >= nyquist {
                bail!(
                    "Tone {}Hz for device {} must be between 0 and {}Hz",
                    tone_hz,
                    device.name,
                    nyquist
                );
            }
        }
        DeviceBackend::Command { program, .. } => {
            if program.trim().is_empty() {
                bail!("Recorder program for device {} cannot be empty", device.name);
            }
        }
    }
    Ok(())
}

/// Validates the configured device list: non-empty, unique names, valid entries.
pub fn validate_capture_devices(devices: &[AudioDevice]) -> Result<()> {
    if devices.is_empty() {
        bail!("At least one capture device must be configured");
    }

    let mut names = HashSet::new();
    for device in devices {
        validate_device(device)?;
        if !names.insert(device.name.as_str()) {
            bail!("Duplicate capture device name: {}", device.name);
        }
    }
    Ok(())
}

/// Validates the server-side maximum capture duration.
pub fn validate_max_duration(duration: Duration) -> Result<()> {
    if duration.is_zero() {
        bail!("Maximum capture duration must be greater than zero");
    }
    Ok(())
}
