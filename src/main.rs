//! Audio Test Harness server: streams host audio capture to remote test clients.

use std::sync::Arc;

use anyhow::{Context, Result};
use tonic::transport::Server;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audio_test_harness::{
    AudioTestHarnessService, CaptureMetrics, CaptureSessionFactory, HostAudioSystem,
    HostConfiguration,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Audio Test Harness server v{}", env!("CARGO_PKG_VERSION"));

    let config = HostConfiguration::load_default()
        .context("Failed to load host configuration")?;

    for (index, device) in config.capture_devices.iter().enumerate() {
        let role = if index == 0 { " (default)" } else { "" };
        info!("Capture device{}: {}", role, device);
    }
    info!("Maximum capture duration: {:?}", config.max_capture_duration());

    let metrics = CaptureMetrics::new();
    let session_factory = CaptureSessionFactory::new(Arc::new(metrics.clone()))
        .with_max_duration(config.max_capture_duration());

    let service = AudioTestHarnessService::new(
        Arc::new(HostAudioSystem::new()),
        session_factory,
        config.capture_devices.clone(),
    );

    info!("Starting gRPC server on {}", config.listen_addr);

    Server::builder()
        .add_service(service.server())
        .serve_with_shutdown(config.listen_addr, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await
        .context("gRPC server failed")?;

    info!("Server stopped: {:?}", metrics.snapshot());

    Ok(())
}
