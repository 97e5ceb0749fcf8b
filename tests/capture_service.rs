//! End-to-end tests for the Capture RPC, driving the service trait directly.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio_stream::StreamExt;
use tonic::{Code, Request, Status};

use audio_test_harness::audio::{AudioDevice, AudioFormat, AudioSystemService, Capturer};
use audio_test_harness::proto_gen::audiotestharness::audio_test_harness_server::AudioTestHarness;
use audio_test_harness::proto_gen::audiotestharness::{CaptureChunk, CaptureRequest};
use audio_test_harness::{
    AudioTestHarnessService, CaptureError, CaptureMetrics, CaptureSessionFactory, HostAudioSystem,
};

/// Capturer returning `good_reads` chunks, then failing every read.
struct ScriptedCapturer {
    device: AudioDevice,
    good_reads: usize,
    reads: AtomicUsize,
    open: AtomicBool,
    close_calls: Arc<AtomicUsize>,
}

impl Capturer for ScriptedCapturer {
    fn device(&self) -> &AudioDevice {
        &self.device
    }

    fn format(&self) -> AudioFormat {
        AudioFormat::default()
    }

    fn read(&self) -> io::Result<Bytes> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
        }
        std::thread::sleep(Duration::from_millis(2));
        let read = self.reads.fetch_add(1, Ordering::SeqCst);
        if read < self.good_reads {
            Ok(Bytes::from(vec![read as u8; 16]))
        } else {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"))
        }
    }

    fn close(&self) -> io::Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

enum Allocation {
    Fail,
    Scripted { good_reads: usize },
}

/// Audio system recording which devices were requested.
struct ScriptedAudioSystem {
    allocation: Allocation,
    requested: Mutex<Vec<String>>,
    close_calls: Arc<AtomicUsize>,
}

impl ScriptedAudioSystem {
    fn new(allocation: Allocation) -> Self {
        Self {
            allocation,
            requested: Mutex::new(Vec::new()),
            close_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn requested(&self) -> Vec<String> {
        self.requested.lock().unwrap().clone()
    }
}

impl AudioSystemService for ScriptedAudioSystem {
    fn create_with_default_format(
        &self,
        device: &AudioDevice,
    ) -> Result<Box<dyn Capturer>, CaptureError> {
        self.requested.lock().unwrap().push(device.name.clone());
        match self.allocation {
            Allocation::Fail => Err(CaptureError::device_unavailable(
                device,
                io::Error::new(io::ErrorKind::Other, "device busy"),
            )),
            Allocation::Scripted { good_reads } => Ok(Box::new(ScriptedCapturer {
                device: device.clone(),
                good_reads,
                reads: AtomicUsize::new(0),
                open: AtomicBool::new(true),
                close_calls: self.close_calls.clone(),
            })),
        }
    }
}

fn service(
    audio_system: Arc<dyn AudioSystemService>,
    devices: Vec<AudioDevice>,
    max_duration: Duration,
) -> (AudioTestHarnessService, CaptureMetrics) {
    let metrics = CaptureMetrics::new();
    let factory = CaptureSessionFactory::new(Arc::new(metrics.clone())).with_max_duration(max_duration);
    (AudioTestHarnessService::new(audio_system, factory, devices), metrics)
}

async fn capture_status(service: &AudioTestHarnessService) -> Status {
    match service.capture(Request::new(CaptureRequest {})).await {
        Ok(_) => panic!("capture unexpectedly succeeded"),
        Err(status) => status,
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn empty_device_list_is_internal_configuration_error() {
    let audio_system = Arc::new(ScriptedAudioSystem::new(Allocation::Scripted { good_reads: 1 }));
    let (service, metrics) = service(audio_system.clone(), vec![], Duration::from_secs(60));

    let status = capture_status(&service).await;

    assert_eq!(status.code(), Code::Internal);
    assert_eq!(status.message(), "Internal Configuration Error.");
    assert!(audio_system.requested().is_empty());
    assert_eq!(metrics.snapshot().allocation_failures, 1);
    assert_eq!(metrics.snapshot().sessions_started, 0);
}

#[tokio::test]
async fn allocation_failure_is_unavailable_with_device_description() {
    let audio_system = Arc::new(ScriptedAudioSystem::new(Allocation::Fail));
    let device = AudioDevice::command("usb-mic", "arecord", vec![]);
    let devices = vec![device.clone(), AudioDevice::simulated("backup", 440.0)];
    let (service, metrics) = service(audio_system.clone(), devices, Duration::from_secs(60));

    let status = capture_status(&service).await;

    assert_eq!(status.code(), Code::Unavailable);
    assert!(status.message().contains(&device.to_string()));
    // Only the default (first) device is tried
    assert_eq!(audio_system.requested(), vec!["usb-mic".to_string()]);
    assert_eq!(metrics.snapshot().sessions_started, 0);
}

#[tokio::test]
async fn read_failure_streams_chunks_then_internal_error() {
    let audio_system = Arc::new(ScriptedAudioSystem::new(Allocation::Scripted { good_reads: 3 }));
    let (service, metrics) = service(
        audio_system.clone(),
        vec![AudioDevice::simulated("scripted", 0.0)],
        Duration::from_secs(60),
    );

    let mut stream = service
        .capture(Request::new(CaptureRequest {}))
        .await
        .unwrap()
        .into_inner();

    let mut chunks: Vec<CaptureChunk> = Vec::new();
    let mut error = None;
    while let Some(item) = stream.next().await {
        match item {
            Ok(chunk) => chunks.push(chunk),
            Err(status) => error = Some(status),
        }
    }

    assert_eq!(
        chunks.iter().map(|c| c.sequence).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert_eq!(chunks[1].data, vec![1u8; 16]);
    let status = error.expect("stream should end with an error");
    assert_eq!(status.code(), Code::Internal);
    assert_eq!(status.message(), "device unplugged");

    let close_calls = audio_system.close_calls.clone();
    wait_for(|| close_calls.load(Ordering::SeqCst) == 1).await;
    wait_for(|| metrics.snapshot().sessions_failed == 1).await;
}

#[tokio::test]
async fn dropping_stream_stops_session_and_releases_device() {
    let audio_system = Arc::new(HostAudioSystem::new());
    let (service, metrics) = service(
        audio_system.clone(),
        vec![AudioDevice::simulated("sim", 440.0)],
        Duration::from_secs(60),
    );

    let mut stream = service
        .capture(Request::new(CaptureRequest {}))
        .await
        .unwrap()
        .into_inner();

    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.sequence, 0);
    let format = first.format.unwrap();
    assert_eq!(format.sample_rate, 48000);
    assert_eq!(first.data.len(), AudioFormat::default().chunk_len());
    assert!(audio_system.is_leased("sim"));

    drop(stream);

    wait_for(|| !audio_system.is_leased("sim")).await;
    wait_for(|| metrics.snapshot().sessions_stopped == 1).await;
    assert_eq!(metrics.snapshot().sessions_failed, 0);
}

#[tokio::test]
async fn busy_device_rejects_second_capture() {
    let audio_system = Arc::new(HostAudioSystem::new());
    let (service, _metrics) = service(
        audio_system.clone(),
        vec![AudioDevice::simulated("sim", 440.0)],
        Duration::from_secs(60),
    );

    let first = service
        .capture(Request::new(CaptureRequest {}))
        .await
        .unwrap()
        .into_inner();

    let status = capture_status(&service).await;
    assert_eq!(status.code(), Code::Unavailable);
    assert!(status.message().contains("sim"));

    drop(first);
    wait_for(|| !audio_system.is_leased("sim")).await;
    assert!(service.capture(Request::new(CaptureRequest {})).await.is_ok());
}

#[tokio::test]
async fn maximum_duration_completes_stream() {
    let audio_system = Arc::new(HostAudioSystem::new());
    let max_duration = Duration::from_millis(350);
    let (service, metrics) = service(
        audio_system.clone(),
        vec![AudioDevice::simulated("sim", 440.0)],
        max_duration,
    );

    let started = Instant::now();
    let mut stream = service
        .capture(Request::new(CaptureRequest {}))
        .await
        .unwrap()
        .into_inner();

    let mut chunks = 0;
    while let Some(item) = stream.next().await {
        item.expect("deadline stop is not an error");
        chunks += 1;
    }
    let elapsed = started.elapsed();

    assert!(chunks > 0);
    assert!(elapsed >= max_duration, "ended early after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(3), "ended late after {:?}", elapsed);
    wait_for(|| !audio_system.is_leased("sim")).await;
    wait_for(|| metrics.snapshot().sessions_stopped == 1).await;
}

#[tokio::test]
async fn read_failure_releases_device_when_client_stops_reading() {
    let audio_system = Arc::new(ScriptedAudioSystem::new(Allocation::Scripted { good_reads: 4 }));
    let (service, metrics) = service(
        audio_system.clone(),
        vec![AudioDevice::simulated("scripted", 0.0)],
        Duration::from_millis(200),
    );

    // Held but never polled: the 4 good chunks fill the outbound channel
    let mut stream = service
        .capture(Request::new(CaptureRequest {}))
        .await
        .unwrap()
        .into_inner();

    let close_calls = audio_system.close_calls.clone();
    wait_for(|| close_calls.load(Ordering::SeqCst) == 1).await;
    wait_for(|| metrics.snapshot().sessions_failed == 1).await;

    let drained = tokio::time::timeout(Duration::from_secs(2), async {
        let mut sequences = Vec::new();
        while let Some(item) = stream.next().await {
            if let Ok(chunk) = item {
                sequences.push(chunk.sequence);
            }
        }
        sequences
    })
    .await
    .expect("stream should end once the session has failed");
    assert_eq!(drained, vec![0, 1, 2, 3]);
}
