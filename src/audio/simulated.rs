/*!
 * Simulated Capture Device
 *
 * Generates a sine tone (or silence) in the device format, paced in real
 * time like a hardware input. Used for hosts without capture hardware and
 * for exercising clients end to end.
 */

use std::f64::consts::PI;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, info};

use super::system::DeviceLease;
use super::{AudioDevice, AudioEncoding, AudioFormat, Capturer, CHUNK_DURATION};

const AMPLITUDE: f64 = 0.5;

struct Clock {
    /// Frames generated so far, keeps the tone phase continuous across reads
    position: u64,
    next_due: Instant,
}

pub struct SimulatedCapturer {
    device: AudioDevice,
    format: AudioFormat,
    tone_hz: f32,
    pacing: Duration,
    clock: Mutex<Clock>,
    is_open: AtomicBool,
    lease: Option<DeviceLease>,
}

impl SimulatedCapturer {
    pub fn new(device: AudioDevice, format: AudioFormat, tone_hz: f32) -> Self {
        info!(
            "Opening simulated capturer for {} ({}Hz tone)",
            device.name, tone_hz
        );
        Self {
            device,
            format,
            tone_hz,
            pacing: CHUNK_DURATION,
            clock: Mutex::new(Clock {
                position: 0,
                next_due: Instant::now(),
            }),
            is_open: AtomicBool::new(true),
            lease: None,
        }
    }

    /// Overrides the delay between reads. `Duration::ZERO` disables pacing.
    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    pub(crate) fn with_lease(mut self, lease: DeviceLease) -> Self {
        self.lease = Some(lease);
        self
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.is_open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("capturer for {} is closed", self.device.name),
            ))
        }
    }

    fn synthesize(&self, start_frame: u64, frames: usize) -> Bytes {
        let mut buf = BytesMut::with_capacity(frames * self.format.bytes_per_frame());
        let rate = f64::from(self.format.sample_rate);
        let tone = f64::from(self.tone_hz);

        for i in 0..frames {
            let t = (start_frame + i as u64) as f64 / rate;
            let value = AMPLITUDE * (2.0 * PI * tone * t).sin();

            // Same sample on every channel
            for _ in 0..self.format.channels {
                match self.format.encoding {
                    AudioEncoding::Pcm16Le => buf.put_i16_le((value * 32767.0) as i16),
                    AudioEncoding::Pcm32FloatLe => buf.put_f32_le(value as f32),
                }
            }
        }

        buf.freeze()
    }
}

impl Capturer for SimulatedCapturer {
    fn device(&self) -> &AudioDevice {
        &self.device
    }

    fn format(&self) -> AudioFormat {
        self.format
    }

    fn read(&self) -> io::Result<Bytes> {
        self.ensure_open()?;

        let mut clock = self.clock.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        if clock.next_due > now {
            std::thread::sleep(clock.next_due - now);
        }
        clock.next_due = clock.next_due.max(now) + self.pacing;

        // Closed while waiting for the next period
        self.ensure_open()?;

        let frames = self.format.chunk_len() / self.format.bytes_per_frame();
        let data = self.synthesize(clock.position, frames);
        clock.position += frames as u64;

        debug!("Simulated {} frames from {}", frames, self.device.name);
        Ok(data)
    }

    fn close(&self) -> io::Result<()> {
        if self.is_open.swap(false, Ordering::AcqRel) {
            info!("Closed simulated capturer for {}", self.device.name);
        }
        if let Some(lease) = &self.lease {
            lease.release();
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::Acquire)
    }
}
