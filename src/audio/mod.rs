/*!
 * Audio Capture Module
 *
 * Device descriptors, audio formats, and the two seams the capture session
 * is built on: [`Capturer`] (a live input stream) and [`AudioSystemService`]
 * (allocates capturers for configured devices).
 */

pub mod command;
pub mod simulated;
pub mod system;

use std::fmt;
use std::io;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::CaptureError;

pub use command::CommandCapturer;
pub use simulated::SimulatedCapturer;
pub use system::HostAudioSystem;

/// Amount of audio returned by a single capturer read.
pub const CHUNK_DURATION: Duration = Duration::from_millis(100);

/// Sample encoding of raw capture data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioEncoding {
    /// Signed 16-bit little-endian PCM
    #[serde(rename = "pcm_s16le")]
    Pcm16Le,
    /// 32-bit float little-endian PCM
    #[serde(rename = "pcm_f32le")]
    Pcm32FloatLe,
}

impl AudioEncoding {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            Self::Pcm16Le => 2,
            Self::Pcm32FloatLe => 4,
        }
    }
}

impl fmt::Display for AudioEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pcm16Le => write!(f, "pcm_s16le"),
            Self::Pcm32FloatLe => write!(f, "pcm_f32le"),
        }
    }
}

/// Audio format a capturer delivers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u32,
    pub encoding: AudioEncoding,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 48000,  // 48kHz standard
            channels: 2,          // Stereo
            encoding: AudioEncoding::Pcm16Le,
        }
    }
}

impl AudioFormat {
    /// Size of one interleaved frame (one sample per channel).
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * self.encoding.bytes_per_sample()
    }

    /// Number of bytes covering `duration` of audio, rounded down to whole frames.
    pub fn bytes_for(&self, duration: Duration) -> usize {
        let frames = (self.sample_rate as u128 * duration.as_micros()) / 1_000_000;
        frames as usize * self.bytes_per_frame()
    }

    /// Number of bytes in one capturer read.
    pub fn chunk_len(&self) -> usize {
        self.bytes_for(CHUNK_DURATION)
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}Hz/{}ch/{}", self.sample_rate, self.channels, self.encoding)
    }
}

fn default_tone_hz() -> f32 {
    440.0
}

/// How audio for a device is obtained on this host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceBackend {
    /// Synthetic sine tone; `tone_hz` of zero produces silence
    Simulated {
        #[serde(default = "default_tone_hz")]
        tone_hz: f32,
    },
    /// External recorder writing raw PCM in the device format to stdout,
    /// e.g. `arecord -t raw` or `parec --raw`
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

/// A configured capture device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioDevice {
    pub name: String,
    pub backend: DeviceBackend,
    /// Overrides the default format for this device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<AudioFormat>,
}

impl AudioDevice {
    /// Simulated device producing a tone at `tone_hz`.
    pub fn simulated(name: impl Into<String>, tone_hz: f32) -> Self {
        Self {
            name: name.into(),
            backend: DeviceBackend::Simulated { tone_hz },
            format: None,
        }
    }

    /// Device backed by an external recorder process.
    pub fn command(name: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            backend: DeviceBackend::Command {
                program: program.into(),
                args,
            },
            format: None,
        }
    }

    pub fn with_format(mut self, format: AudioFormat) -> Self {
        self.format = Some(format);
        self
    }

    /// The format capturers for this device are opened with.
    pub fn default_format(&self) -> AudioFormat {
        self.format.unwrap_or_default()
    }
}

impl fmt::Display for AudioDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let backend = match &self.backend {
            DeviceBackend::Simulated { .. } => "simulated".to_string(),
            DeviceBackend::Command { program, .. } => format!("command:{}", program),
        };
        write!(
            f,
            "AudioDevice(name={}, backend={}, format={})",
            self.name,
            backend,
            self.default_format()
        )
    }
}

/// One unit of captured audio handed to the outbound sink
#[derive(Debug, Clone)]
pub struct CaptureChunk {
    /// Zero-based position within the session
    pub sequence: u64,
    /// Capture time in milliseconds since the Unix epoch
    pub timestamp_ms: i64,
    pub format: AudioFormat,
    pub data: Bytes,
}

impl CaptureChunk {
    pub fn new(sequence: u64, format: AudioFormat, data: Bytes) -> Self {
        Self {
            sequence,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            format,
            data,
        }
    }
}

/// Live, exclusive binding to one capture device.
///
/// Methods take `&self` so that `close` can be called from another thread
/// while a `read` is blocked. Once closed, `read` must fail promptly instead
/// of blocking.
pub trait Capturer: Send + Sync {
    fn device(&self) -> &AudioDevice;

    fn format(&self) -> AudioFormat;

    /// Blocks for at most about one [`CHUNK_DURATION`] and returns raw audio
    /// in [`Capturer::format`].
    fn read(&self) -> io::Result<Bytes>;

    /// Releases the device. Idempotent.
    fn close(&self) -> io::Result<()>;

    fn is_open(&self) -> bool;
}

/// Allocates capturers for configured devices.
pub trait AudioSystemService: Send + Sync {
    /// Opens `device` with its default format. Fails with
    /// [`CaptureError::DeviceUnavailable`] when the device cannot be used.
    fn create_with_default_format(
        &self,
        device: &AudioDevice,
    ) -> Result<Box<dyn Capturer>, CaptureError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_format_default() {
        let format = AudioFormat::default();
        assert_eq!(format.sample_rate, 48000);
        assert_eq!(format.channels, 2);
        assert_eq!(format.encoding, AudioEncoding::Pcm16Le);
    }

    #[test]
    fn test_chunk_len_is_whole_frames() {
        let format = AudioFormat::default();
        // 100ms of 48kHz stereo s16
        assert_eq!(format.chunk_len(), 4800 * 4);

        let odd = AudioFormat {
            sample_rate: 44100,
            channels: 1,
            encoding: AudioEncoding::Pcm32FloatLe,
        };
        assert_eq!(odd.chunk_len(), 4410 * 4);
        assert_eq!(odd.bytes_for(Duration::from_micros(50)) % odd.bytes_per_frame(), 0);
    }

    #[test]
    fn test_device_description_names_device() {
        let device = AudioDevice::command("usb-mic", "arecord", vec![]);
        let description = device.to_string();
        assert!(description.contains("usb-mic"));
        assert!(description.contains("command:arecord"));
        assert!(description.contains("48000Hz/2ch/pcm_s16le"));
    }

    #[test]
    fn test_device_backend_deserialize() {
        let json = r#"{
            "name": "loopback",
            "backend": { "type": "command", "program": "parec", "args": ["--raw"] },
            "format": { "sample_rate": 16000, "channels": 1, "encoding": "pcm_s16le" }
        }"#;
        let device: AudioDevice = serde_json::from_str(json).unwrap();
        assert_eq!(device.name, "loopback");
        assert_eq!(
            device.backend,
            DeviceBackend::Command {
                program: "parec".to_string(),
                args: vec!["--raw".to_string()],
            }
        );
        assert_eq!(device.default_format().sample_rate, 16000);

        let simulated: AudioDevice =
            serde_json::from_str(r#"{ "name": "sim", "backend": { "type": "simulated" } }"#).unwrap();
        assert_eq!(simulated.backend, DeviceBackend::Simulated { tone_hz: 440.0 });
        assert_eq!(simulated.default_format(), AudioFormat::default());
    }
}
