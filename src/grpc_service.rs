/*!
 * gRPC Service Implementation
 *
 * Implements the AudioTestHarness gRPC service: resolves the default capture
 * device, allocates a capturer, and streams a capture session to the client.
 */

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{self, OwnedPermit};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use crate::audio::{AudioDevice, AudioEncoding, AudioFormat, AudioSystemService, CaptureChunk, Capturer};
use crate::error::{CaptureError, SinkError};
use crate::proto_gen::audiotestharness as pb;
use crate::proto_gen::audiotestharness::audio_test_harness_server::{
    AudioTestHarness, AudioTestHarnessServer,
};
use crate::session::{CaptureSessionFactory, ChunkSink};

/// Chunks buffered between the session and the transport.
pub const CHUNK_CHANNEL_CAPACITY: usize = 4;

type StreamItem = Result<pb::CaptureChunk, Status>;

impl From<AudioEncoding> for pb::AudioEncoding {
    fn from(encoding: AudioEncoding) -> Self {
        match encoding {
            AudioEncoding::Pcm16Le => pb::AudioEncoding::Pcm16Le,
            AudioEncoding::Pcm32FloatLe => pb::AudioEncoding::Pcm32FloatLe,
        }
    }
}

impl From<AudioFormat> for pb::AudioFormat {
    fn from(format: AudioFormat) -> Self {
        pb::AudioFormat {
            sample_rate: format.sample_rate,
            channels: format.channels,
            encoding: pb::AudioEncoding::from(format.encoding) as i32,
        }
    }
}

impl From<CaptureChunk> for pb::CaptureChunk {
    fn from(chunk: CaptureChunk) -> Self {
        pb::CaptureChunk {
            data: chunk.data.to_vec(),
            format: Some(chunk.format.into()),
            sequence: chunk.sequence,
            timestamp_ms: chunk.timestamp_ms,
        }
    }
}

/// [`ChunkSink`] writing into a tonic server-streaming response.
///
/// The stream ends when the sink completes or fails. Dropping the response
/// stream on the client side is reported as [`SinkError::ClientGone`] and to
/// the handler registered with [`GrpcChunkSink::on_cancel`].
pub struct GrpcChunkSink {
    sender: Mutex<Option<mpsc::Sender<StreamItem>>>,
    permit: Mutex<Option<OwnedPermit<StreamItem>>>,
}

impl GrpcChunkSink {
    pub fn new(sender: mpsc::Sender<StreamItem>) -> Self {
        Self {
            sender: Mutex::new(Some(sender)),
            permit: Mutex::new(None),
        }
    }

    /// Runs `handler` if the client goes away before `until` resolves.
    pub fn on_cancel<U, F>(&self, until: U, handler: F)
    where
        U: Future<Output = ()> + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        let Some(sender) = self.sender() else {
            return;
        };

        tokio::spawn(async move {
            tokio::select! {
                _ = sender.closed() => {
                    debug!("Client cancelled capture stream");
                    handler();
                }
                _ = until => {}
            }
        });
    }

    fn sender(&self) -> Option<mpsc::Sender<StreamItem>> {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn take_permit(&self) -> Option<OwnedPermit<StreamItem>> {
        self.permit.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn take_sender(&self) -> Option<mpsc::Sender<StreamItem>> {
        self.sender.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

#[tonic::async_trait]
impl ChunkSink for GrpcChunkSink {
    async fn ready(&self) -> Result<(), SinkError> {
        let sender = self.sender().ok_or(SinkError::ClientGone)?;
        let permit = sender
            .reserve_owned()
            .await
            .map_err(|_| SinkError::ClientGone)?;
        *self.permit.lock().unwrap_or_else(|e| e.into_inner()) = Some(permit);
        Ok(())
    }

    fn emit(&self, chunk: CaptureChunk) -> Result<(), SinkError> {
        let permit = self.take_permit().ok_or(SinkError::ClientGone)?;
        permit.send(Ok(chunk.into()));
        Ok(())
    }

    async fn complete(&self) {
        drop(self.take_permit());
        drop(self.take_sender());
    }

    async fn fail(&self, error: &CaptureError) {
        let status = Status::from(error);
        let permit = self.take_permit();
        let sender = self.take_sender();

        match (permit, sender) {
            (Some(permit), _) => {
                permit.send(Err(status));
            }
            (None, Some(sender)) => {
                // Nobody is listening any more if this fails
                let _ = sender.send(Err(status)).await;
            }
            (None, None) => {}
        }
    }
}

/// gRPC entry point for capture requests
pub struct AudioTestHarnessService {
    audio_system: Arc<dyn AudioSystemService>,
    session_factory: CaptureSessionFactory,
    capture_devices: Vec<AudioDevice>,
}

impl AudioTestHarnessService {
    pub fn new(
        audio_system: Arc<dyn AudioSystemService>,
        session_factory: CaptureSessionFactory,
        capture_devices: Vec<AudioDevice>,
    ) -> Self {
        info!(
            "Initializing Audio Test Harness service with {} capture device(s)",
            capture_devices.len()
        );
        Self {
            audio_system,
            session_factory,
            capture_devices,
        }
    }

    pub fn server(self) -> AudioTestHarnessServer<Self> {
        AudioTestHarnessServer::new(self)
    }

    /// Allocates a capturer for the first configured device.
    fn allocate_default_capturer(&self) -> Result<Box<dyn Capturer>, CaptureError> {
        let device = self
            .capture_devices
            .first()
            .ok_or(CaptureError::NoCaptureDevice)?;
        self.audio_system.create_with_default_format(device)
    }
}

#[tonic::async_trait]
impl AudioTestHarness for AudioTestHarnessService {
    type CaptureStream = ReceiverStream<StreamItem>;

    async fn capture(
        &self,
        request: Request<pb::CaptureRequest>,
    ) -> Result<Response<Self::CaptureStream>, Status> {
        let _req = request.into_inner();
        info!(
            "Handling Capture procedure (max duration {:?})",
            self.session_factory.max_duration()
        );

        let capturer = self.allocate_default_capturer().map_err(|e| {
            self.session_factory
                .observer()
                .on_allocation_failed(self.capture_devices.first(), &e);
            Status::from(e)
        })?;

        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let sink = Arc::new(GrpcChunkSink::new(tx));
        let session = self
            .session_factory
            .create_capture_session(sink.clone(), capturer);

        // Capture until the client cancels or the maximum duration is hit
        let stopped = {
            let session = session.clone();
            async move { session.stopped().await }
        };
        let cancelled = session.clone();
        sink.on_cancel(stopped, move || cancelled.stop());

        tokio::spawn(async move {
            // Failures already reached the client through the sink as INTERNAL
            if let Err(e) = session.start().await {
                debug!(session = %session.id(), "Capture ended with error: {}", e);
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
