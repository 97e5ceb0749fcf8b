//! Session observability for the capture service.
//!
//! The capture session reports lifecycle events through [`SessionObserver`]
//! and never inspects the outcome, so observers cannot influence how a
//! session ends. [`CaptureMetrics`] is the observer the server installs: it
//! logs each event through `tracing` and keeps thread-safe counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audio::{AudioDevice, CaptureChunk};
use crate::error::CaptureError;
use crate::session::StopReason;

/// Receives capture session lifecycle events. All methods default to no-ops.
pub trait SessionObserver: Send + Sync {
    fn on_started(&self, _session: Uuid, _device: &AudioDevice) {}

    fn on_chunk_emitted(&self, _session: Uuid, _chunk: &CaptureChunk) {}

    fn on_stopped(&self, _session: Uuid, _reason: StopReason, _chunks: u64) {}

    fn on_failed(&self, _session: Uuid, _error: &CaptureError, _chunks: u64) {}

    /// Reported by the service when a capture request never got a session.
    fn on_allocation_failed(&self, _device: Option<&AudioDevice>, _error: &CaptureError) {}
}

/// Observer that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}

/// Point-in-time copy of [`CaptureMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub sessions_started: u64,
    pub sessions_stopped: u64,
    pub sessions_failed: u64,
    pub allocation_failures: u64,
    pub chunks_emitted: u64,
    pub bytes_emitted: u64,
}

impl CaptureStats {
    /// Sessions that started and have not reached a terminal state.
    pub fn active_sessions(&self) -> u64 {
        self.sessions_started
            .saturating_sub(self.sessions_stopped + self.sessions_failed)
    }
}

/// Aggregated capture metrics for the server instance.
#[derive(Clone, Debug, Default)]
pub struct CaptureMetrics {
    sessions_started: Arc<AtomicU64>,
    sessions_stopped: Arc<AtomicU64>,
    sessions_failed: Arc<AtomicU64>,
    allocation_failures: Arc<AtomicU64>,
    chunks_emitted: Arc<AtomicU64>,
    bytes_emitted: Arc<AtomicU64>,
}

impl CaptureMetrics {
    /// Creates a new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current counter values.
    pub fn snapshot(&self) -> CaptureStats {
        CaptureStats {
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_stopped: self.sessions_stopped.load(Ordering::Relaxed),
            sessions_failed: self.sessions_failed.load(Ordering::Relaxed),
            allocation_failures: self.allocation_failures.load(Ordering::Relaxed),
            chunks_emitted: self.chunks_emitted.load(Ordering::Relaxed),
            bytes_emitted: self.bytes_emitted.load(Ordering::Relaxed),
        }
    }
}

impl SessionObserver for CaptureMetrics {
    fn on_started(&self, session: Uuid, device: &AudioDevice) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
        info!(%session, device = %device.name, "Capture session started");
    }

    fn on_chunk_emitted(&self, session: Uuid, chunk: &CaptureChunk) {
        self.chunks_emitted.fetch_add(1, Ordering::Relaxed);
        self.bytes_emitted
            .fetch_add(chunk.data.len() as u64, Ordering::Relaxed);
        debug!(%session, sequence = chunk.sequence, bytes = chunk.data.len(), "Emitted capture chunk");
    }

    fn on_stopped(&self, session: Uuid, reason: StopReason, chunks: u64) {
        self.sessions_stopped.fetch_add(1, Ordering::Relaxed);
        match reason {
            StopReason::DeadlineExceeded => {
                warn!(%session, chunks, "Capture session hit maximum duration, stopped")
            }
            _ => info!(%session, chunks, ?reason, "Capture session stopped"),
        }
    }

    fn on_failed(&self, session: Uuid, error: &CaptureError, chunks: u64) {
        self.sessions_failed.fetch_add(1, Ordering::Relaxed);
        error!(%session, chunks, "Capture session failed: {}", error);
    }

    fn on_allocation_failed(&self, device: Option<&AudioDevice>, error: &CaptureError) {
        self.allocation_failures.fetch_add(1, Ordering::Relaxed);
        match device {
            Some(device) => error!("Failed to allocate AudioCapturer {}: {:?}", device, error),
            None => error!(
                "Invalid host configuration, no capture device provided. \
                 This indicates an issue with the server deployment: {}",
                error
            ),
        }
    }
}
