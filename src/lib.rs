/*!
 * Audio Test Harness Library
 *
 * Exposes a host's audio capture devices to remote test clients over a
 * gRPC server stream.
 */

pub mod audio;
pub mod config;
pub mod error;
pub mod grpc_service;
pub mod metrics;
pub mod session;
pub mod validation;

// Generated proto code
pub mod proto_gen {
    pub mod audiotestharness {
        tonic::include_proto!("audiotestharness");
    }
}

// Re-export commonly used types
pub use audio::{AudioDevice, AudioFormat, AudioSystemService, CaptureChunk, Capturer, HostAudioSystem};
pub use config::HostConfiguration;
pub use error::{CaptureError, SinkError};
pub use grpc_service::{AudioTestHarnessService, GrpcChunkSink};
pub use metrics::{CaptureMetrics, SessionObserver};
pub use session::{
    CaptureSession, CaptureSessionFactory, ChunkSink, SessionState, StopReason, MAX_CAPTURE_DURATION,
};
