/*!
 * External Recorder Capture
 *
 * Captures from a recorder process that writes raw PCM to stdout, such as
 * `arecord -t raw -f S16_LE -r 48000 -c 2 -D hw:1,0` (ALSA) or
 * `parec --raw --format=s16le --rate=48000 --channels=2` (PulseAudio).
 * The process must emit audio in the device's configured format.
 */

use std::io::{self, Read};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::system::DeviceLease;
use super::{AudioDevice, AudioFormat, Capturer};

pub struct CommandCapturer {
    device: AudioDevice,
    format: AudioFormat,
    child: Mutex<Option<Child>>,
    stdout: Mutex<ChildStdout>,
    is_open: AtomicBool,
    lease: Option<DeviceLease>,
}

impl CommandCapturer {
    /// Starts the recorder process for `device`.
    pub fn spawn(
        device: AudioDevice,
        format: AudioFormat,
        program: &str,
        args: &[String],
    ) -> io::Result<Self> {
        info!("Starting recorder for {}: {} {:?}", device.name, program, args);

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "recorder stdout was not captured",
                ));
            }
        };

        Ok(Self {
            device,
            format,
            child: Mutex::new(Some(child)),
            stdout: Mutex::new(stdout),
            is_open: AtomicBool::new(true),
            lease: None,
        })
    }

    pub(crate) fn with_lease(mut self, lease: DeviceLease) -> Self {
        self.lease = Some(lease);
        self
    }

    fn closed_error(&self) -> io::Error {
        io::Error::new(
            io::ErrorKind::NotConnected,
            format!("capturer for {} is closed", self.device.name),
        )
    }
}

impl Capturer for CommandCapturer {
    fn device(&self) -> &AudioDevice {
        &self.device
    }

    fn format(&self) -> AudioFormat {
        self.format
    }

    fn read(&self) -> io::Result<Bytes> {
        if !self.is_open() {
            return Err(self.closed_error());
        }

        let mut buf = vec![0u8; self.format.chunk_len()];
        let result = {
            let mut stdout = self.stdout.lock().unwrap_or_else(|e| e.into_inner());
            stdout.read_exact(&mut buf)
        };

        match result {
            Ok(()) => {
                debug!("Read {} bytes from {}", buf.len(), self.device.name);
                Ok(Bytes::from(buf))
            }
            // Killed by close() while blocked in read
            Err(_) if !self.is_open() => Err(self.closed_error()),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("recorder for {} stopped producing audio", self.device.name),
            )),
            Err(e) => Err(e),
        }
    }

    fn close(&self) -> io::Result<()> {
        if !self.is_open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let child = self.child.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut child) = child {
            // Fails with InvalidInput when the process already exited
            if let Err(e) = child.kill() {
                debug!("Recorder for {} already exited: {}", self.device.name, e);
            }
            reap(child, self.device.name.clone());
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

/// Waits for a killed recorder. Inside a tokio runtime the wait runs on the
/// blocking pool so `close` never stalls an async worker.
fn reap(child: Child, device_name: String) {
    let wait = move || {
        let mut child = child;
        match child.wait() {
            Ok(status) => info!("Recorder for {} stopped ({})", device_name, status),
            Err(e) => warn!("Failed to reap recorder for {}: {}", device_name, e),
        }
    };

    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(wait);
        }
        Err(_) => wait(),
    }
}

impl Drop for CommandCapturer {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to stop recorder for {}: {}", self.device.name, e);
        }
    }
}
