//! Host configuration for the audio test harness server.
//!
//! Configuration is a JSON document:
//!
//! ```json
//! {
//!   "listen_addr": "0.0.0.0:49152",
//!   "max_capture_duration_secs": 3600,
//!   "capture_devices": [
//!     { "name": "usb-mic",
//!       "backend": { "type": "command", "program": "arecord",
//!                    "args": ["-q", "-t", "raw", "-f", "S16_LE", "-r", "48000", "-c", "2", "-D", "hw:1,0"] } }
//!   ]
//! }
//! ```
//!
//! The first capture device is the one clients capture from.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::audio::AudioDevice;
use crate::session::MAX_CAPTURE_DURATION;
use crate::validation;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV_VAR: &str = "AUDIO_HARNESS_CONFIG";

/// Default gRPC port.
pub const DEFAULT_PORT: u16 = 49152;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfiguration {
    pub listen_addr: SocketAddr,
    pub max_capture_duration_secs: u64,
    pub capture_devices: Vec<AudioDevice>,
}

impl Default for HostConfiguration {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            max_capture_duration_secs: MAX_CAPTURE_DURATION.as_secs(),
            capture_devices: vec![AudioDevice::simulated("simulated", 440.0)],
        }
    }
}

impl HostConfiguration {
    pub fn max_capture_duration(&self) -> Duration {
        Duration::from_secs(self.max_capture_duration_secs)
    }

    /// The device capture requests are served from.
    pub fn default_capture_device(&self) -> Option<&AudioDevice> {
        self.capture_devices.first()
    }

    /// Parses a JSON document without validating it.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse host configuration")
    }

    /// Reads, parses, and validates the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration {}", path.display()))?;
        let config = Self::from_json(&json)
            .with_context(|| format!("Invalid configuration {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid configuration {}", path.display()))?;
        info!("Loaded host configuration from {}", path.display());
        Ok(config)
    }

    /// Loads from `$AUDIO_HARNESS_CONFIG`, then the per-user config file,
    /// falling back to the built-in defaults.
    pub fn load_default() -> Result<Self> {
        if let Some(path) = std::env::var_os(CONFIG_ENV_VAR) {
            return Self::load(Path::new(&path));
        }

        match default_config_path() {
            Some(path) if path.is_file() => Self::load(&path),
            _ => {
                info!("No configuration file found, using defaults");
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        validation::validate_capture_devices(&self.capture_devices)?;
        validation::validate_max_duration(self.max_capture_duration())?;
        Ok(())
    }
}

/// `<config dir>/audio-test-harness/config.json`, e.g. `~/.config/...` on Linux.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("audio-test-harness").join("config.json"))
}
