use anyhow::Context;
use camera_service::{CameraService, FrameStats, PowerState, ServiceConfig};
use common::{TelemetryGuard, setup_logging};
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    flag,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const STATS_EVERY_FRAMES: u64 = 30;
const DELETE_TIMEOUT: Duration = Duration::from_secs(5);

fn main() -> anyhow::Result<()> {
    let config = ServiceConfig::from_env()?;

    // TelemetryGuard requires a Tokio runtime for async OTLP exporters.
    // We must keep the runtime alive for the batch exporter to work.
    let (_telemetry, _runtime) = if let Some(endpoint) = config.otel_endpoint.as_ref() {
        let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
        let guard = rt.block_on(async {
            TelemetryGuard::init("camera-service", endpoint, config.environment)
        })?;
        (Some(guard), Some(rt))
    } else {
        setup_logging(config.environment);
        (None, None)
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    flag::register(SIGTERM, Arc::clone(&shutdown))?;
    flag::register(SIGINT, Arc::clone(&shutdown))?;

    tracing::info!("Signal handlers registered (SIGTERM, SIGINT)");
    tracing::info!("Camera service starting with config: {:?}", config);

    let mut camera = CameraService::from_config(&config);
    camera.register_on_restart(Box::new(|| tracing::warn!("Camera server restarted")));
    camera
        .init()
        .context("Failed to initialize camera - check that the camera server is running")?;

    let mut stats = FrameStats::default();
    while !shutdown.load(Ordering::Relaxed) {
        if let Err(e) = camera.update() {
            tracing::warn!(error = %e, "Camera update failed");
        }

        if let Some(frame) = camera.get_frame(0) {
            let _span = common::span_debug!("frame");
            stats.record(&frame);
            camera.release_frame(frame.frame_id);

            if stats.frames() % STATS_EVERY_FRAMES == 0 {
                tracing::info!(
                    frames = stats.frames(),
                    skipped = stats.skipped(),
                    fps = stats.fps(),
                    width = frame.width,
                    height = frame.height,
                    format = ?frame.format,
                    "Frame statistics"
                );
            }
        }

        thread::sleep(config.poll_interval);
    }

    tracing::info!("Shutting down camera");
    if let Err(e) = camera.delete() {
        tracing::warn!(error = %e, "Camera not running, skipping orderly shutdown");
        return Ok(());
    }

    let deadline = Instant::now() + DELETE_TIMEOUT;
    while camera.power_state() != PowerState::Off {
        if Instant::now() > deadline {
            anyhow::bail!("Camera did not shut down within {:?}", DELETE_TIMEOUT);
        }
        camera.update()?;
        thread::sleep(config.poll_interval);
    }

    tracing::info!("Camera service stopped gracefully");
    Ok(())
}
