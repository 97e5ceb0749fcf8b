/*!
 * Capture Session
 *
 * Drives one client's capture from start to termination: reads chunks from
 * an exclusively owned [`Capturer`], hands them to a [`ChunkSink`], and
 * stops on request, on client disconnect, on read failure, or when the
 * maximum duration elapses.
 *
 * State machine:
 * ```text
 * Created → Running → Stopped
 *                   ↘ Failed
 * ```
 * `stop()` may be called from any thread at any time. The capturer is
 * closed exactly once, on every path.
 */

use std::io;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Once, OnceLock};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::audio::{CaptureChunk, Capturer};
use crate::error::{CaptureError, SinkError};
use crate::metrics::{NoopObserver, SessionObserver};

/// Longest a capture session may run before the server stops it.
pub const MAX_CAPTURE_DURATION: Duration = Duration::from_secs(60 * 60);

/// Upper bound on handing a read failure to the sink before the capturer is
/// released anyway. Also capped by the time left before the deadline.
pub const FAILURE_REPORT_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle state of a [`CaptureSession`]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created = 0,
    Running = 1,
    Stopped = 2,
    Failed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Stopped,
            _ => Self::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

/// Why a session ended up in [`SessionState::Stopped`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `stop()` was called, typically from the client cancellation handler
    Requested,
    /// The maximum capture duration elapsed
    DeadlineExceeded,
    /// The sink reported the client unreachable
    ClientGone,
}

/// Outbound stream of chunks to one client.
///
/// Emission is split in two: `ready` waits for transport capacity and may
/// take arbitrarily long, `emit` must hand the chunk over without waiting.
/// The session never calls `emit` without a successful `ready` before it.
#[tonic::async_trait]
pub trait ChunkSink: Send + Sync {
    async fn ready(&self) -> Result<(), SinkError>;

    fn emit(&self, chunk: CaptureChunk) -> Result<(), SinkError>;

    /// Ends the stream successfully. Idempotent.
    async fn complete(&self);

    /// Ends the stream with `error`. Idempotent.
    async fn fail(&self, error: &CaptureError);
}

struct SessionInner {
    id: Uuid,
    capturer: Arc<dyn Capturer>,
    sink: Arc<dyn ChunkSink>,
    observer: Arc<dyn SessionObserver>,
    max_duration: Duration,
    state: AtomicU8,
    stop_signal: CancellationToken,
    // Serializes the final stop check before emit against stop() raising the signal
    emit_gate: Mutex<()>,
    release: Once,
    stop_reason: OnceLock<StopReason>,
    failure: OnceLock<String>,
    chunks_emitted: AtomicU64,
}

impl SessionInner {
    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: SessionState, to: SessionState) -> Result<(), SessionState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(SessionState::from_u8)
    }

    fn raise_stop_signal(&self) {
        let _gate = self.emit_gate.lock().unwrap_or_else(|e| e.into_inner());
        self.stop_signal.cancel();
    }

    /// Closes the capturer once. Concurrent callers wait for the close to finish.
    fn release_capturer(&self) {
        self.release.call_once(|| {
            if let Err(e) = self.capturer.close() {
                warn!(session = %self.id, "Error closing capturer: {}", e);
            }
            debug!(session = %self.id, "Capturer released");
        });
    }

    /// Hands `chunk` to the sink unless a stop has been requested.
    /// Returns `Ok(false)` when the chunk was discarded.
    fn emit_unless_stopped(&self, chunk: CaptureChunk) -> Result<bool, SinkError> {
        let _gate = self.emit_gate.lock().unwrap_or_else(|e| e.into_inner());
        if self.stop_signal.is_cancelled() {
            return Ok(false);
        }
        self.sink.emit(chunk)?;
        Ok(true)
    }
}

/// Handle to one capture session. Clones share the same session.
#[derive(Clone)]
pub struct CaptureSession {
    inner: Arc<SessionInner>,
}

impl CaptureSession {
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn chunks_emitted(&self) -> u64 {
        self.inner.chunks_emitted.load(Ordering::Acquire)
    }

    pub fn max_duration(&self) -> Duration {
        self.inner.max_duration
    }

    /// Set once the session stopped; `None` while running or after a failure.
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.inner.stop_reason.get().copied()
    }

    /// Description of the read error that failed the session.
    pub fn failure(&self) -> Option<&str> {
        self.inner.failure.get().map(String::as_str)
    }

    pub fn is_capturer_released(&self) -> bool {
        self.inner.release.is_completed()
    }

    /// Resolves once the session has been asked to stop or has terminated.
    pub async fn stopped(&self) {
        self.inner.stop_signal.cancelled().await
    }

    /// Stops the session. Idempotent and safe to call from any thread.
    ///
    /// No chunk reaches the sink after this returns.
    pub fn stop(&self) {
        self.stop_with(StopReason::Requested);
    }

    pub(crate) fn stop_with(&self, reason: StopReason) {
        let inner = &self.inner;

        let stopped = inner
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                match SessionState::from_u8(state) {
                    SessionState::Created | SessionState::Running => {
                        Some(SessionState::Stopped as u8)
                    }
                    _ => None,
                }
            })
            .is_ok();
        if stopped {
            let _ = inner.stop_reason.set(reason);
            debug!(session = %inner.id, ?reason, "Stop requested");
        }

        inner.raise_stop_signal();
        inner.release_capturer();
    }

    /// Runs the capture until it terminates.
    ///
    /// Returns the terminal state, or the read error that failed the session.
    /// A session stopped before it started completes its sink and returns
    /// `Ok(SessionState::Stopped)` without reading.
    pub async fn start(&self) -> Result<SessionState, CaptureError> {
        let inner = &self.inner;

        if let Err(current) = inner.transition(SessionState::Created, SessionState::Running) {
            if !current.is_terminal() {
                return Err(CaptureError::AlreadyStarted);
            }
            inner.release_capturer();
            inner.sink.complete().await;
            return Ok(current);
        }

        inner.observer.on_started(inner.id, inner.capturer.device());

        let started = Instant::now();
        let deadline = self.spawn_deadline();
        let outcome = self.run_loop().await;
        deadline.abort();

        let report_timeout = inner
            .max_duration
            .saturating_sub(started.elapsed())
            .min(FAILURE_REPORT_TIMEOUT);
        self.finish(outcome, report_timeout).await
    }

    fn spawn_deadline(&self) -> JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = session.stopped() => {}
                _ = tokio::time::sleep(session.inner.max_duration) => {
                    session.stop_with(StopReason::DeadlineExceeded);
                }
            }
        })
    }

    async fn run_loop(&self) -> io::Result<()> {
        let inner = &self.inner;
        let format = inner.capturer.format();
        let mut sequence = 0u64;

        loop {
            if inner.stop_signal.is_cancelled() {
                return Ok(());
            }

            let capturer = inner.capturer.clone();
            let read = tokio::select! {
                biased;
                _ = inner.stop_signal.cancelled() => return Ok(()),
                read = tokio::task::spawn_blocking(move || capturer.read()) => read,
            };

            let data = match read {
                Ok(Ok(data)) => data,
                // stop() closes the capturer, failing the read it interrupted
                Ok(Err(_)) | Err(_) if inner.stop_signal.is_cancelled() => return Ok(()),
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(io::Error::new(io::ErrorKind::Other, e)),
            };

            let ready = tokio::select! {
                biased;
                _ = inner.stop_signal.cancelled() => return Ok(()),
                ready = inner.sink.ready() => ready,
            };

            let chunk = CaptureChunk::new(sequence, format, data);
            let emitted = ready.and_then(|()| inner.emit_unless_stopped(chunk.clone()));

            match emitted {
                Ok(true) => {
                    inner.chunks_emitted.fetch_add(1, Ordering::AcqRel);
                    inner.observer.on_chunk_emitted(inner.id, &chunk);
                    sequence += 1;
                }
                // Read finished after the stop signal; the chunk is dropped
                Ok(false) => return Ok(()),
                Err(SinkError::ClientGone) => {
                    self.stop_with(StopReason::ClientGone);
                    return Ok(());
                }
            }
        }
    }

    async fn finish(
        &self,
        outcome: io::Result<()>,
        report_timeout: Duration,
    ) -> Result<SessionState, CaptureError> {
        let inner = &self.inner;

        match outcome {
            Err(e) if inner.transition(SessionState::Running, SessionState::Failed).is_ok() => {
                let error = CaptureError::Io(e);
                let _ = inner.failure.set(error.to_string());
                inner.raise_stop_signal();

                // A client that stopped reading must not keep the device allocated
                if tokio::time::timeout(report_timeout, inner.sink.fail(&error))
                    .await
                    .is_err()
                {
                    warn!(session = %inner.id, "Client did not accept the failure within {:?}", report_timeout);
                }
                inner.release_capturer();

                inner.observer.on_failed(inner.id, &error, self.chunks_emitted());
                Err(error)
            }
            // Clean exit, or stop() won the race against a read error
            _ => {
                self.stop_with(StopReason::Requested);
                inner.sink.complete().await;

                let reason = self.stop_reason().unwrap_or(StopReason::Requested);
                inner.observer.on_stopped(inner.id, reason, self.chunks_emitted());
                Ok(self.state())
            }
        }
    }
}

/// Builds capture sessions. Construction performs no I/O.
#[derive(Clone)]
pub struct CaptureSessionFactory {
    max_duration: Duration,
    observer: Arc<dyn SessionObserver>,
}

impl CaptureSessionFactory {
    pub fn new(observer: Arc<dyn SessionObserver>) -> Self {
        Self {
            max_duration: MAX_CAPTURE_DURATION,
            observer,
        }
    }

    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = max_duration;
        self
    }

    pub fn max_duration(&self) -> Duration {
        self.max_duration
    }

    pub fn observer(&self) -> &Arc<dyn SessionObserver> {
        &self.observer
    }

    /// Binds a new session to `sink` and `capturer` without starting capture.
    pub fn create_capture_session(
        &self,
        sink: Arc<dyn ChunkSink>,
        capturer: Box<dyn Capturer>,
    ) -> CaptureSession {
        CaptureSession {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4(),
                capturer: Arc::from(capturer),
                sink,
                observer: self.observer.clone(),
                max_duration: self.max_duration,
                state: AtomicU8::new(SessionState::Created as u8),
                stop_signal: CancellationToken::new(),
                emit_gate: Mutex::new(()),
                release: Once::new(),
                stop_reason: OnceLock::new(),
                failure: OnceLock::new(),
                chunks_emitted: AtomicU64::new(0),
            }),
        }
    }
}

impl Default for CaptureSessionFactory {
    fn default() -> Self {
        Self::new(Arc::new(NoopObserver))
    }
}
