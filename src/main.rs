use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use lens_stream::{
    Capture, CaptureLoop, CaptureOptions, ConnectionManager, ConsoleRenderer, ErrorReporter,
    ImageFormat, LinkState, LogReporter, PredictionResult, Render, ReplayCapture, StreamConfig,
};

const DEFAULT_SOURCE: &str = if cfg!(feature = "camera") {
    "camera"
} else {
    "replay"
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Source {
    /// Pre-compressed frames from --replay-dir
    Replay,
    /// A local webcam (needs the `camera` feature)
    Camera,
}

/// Stream frames to an inference service and print its predictions.
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// WebSocket endpoint of the inference service
    #[arg(long, env = "LENS_STREAM_ENDPOINT", default_value = lens_stream::config::DEFAULT_ENDPOINT)]
    endpoint: String,

    /// Capture period in milliseconds
    #[arg(long, env = "LENS_STREAM_INTERVAL_MS", default_value_t = 1000)]
    interval_ms: u64,

    /// Capture quality ratio, (0, 1]
    #[arg(long, default_value_t = 0.5)]
    quality: f32,

    /// Recompression ratio, (0, 1]
    #[arg(long, default_value_t = 0.5)]
    compress: f32,

    /// Frame codec: jpeg or png
    #[arg(long, default_value = "jpeg")]
    format: ImageFormat,

    /// Frame source; camera when built with the `camera` feature
    #[arg(long, value_enum, env = "LENS_STREAM_SOURCE", default_value = DEFAULT_SOURCE)]
    source: Source,

    /// Directory of frames for --source replay
    #[arg(long, env = "LENS_STREAM_REPLAY_DIR")]
    replay_dir: Option<PathBuf>,

    #[arg(long, default_value_t = 0)]
    camera_index: u32,

    /// DER certificate to pin for wss:// endpoints
    #[arg(long, env = "LENS_STREAM_PINNED_CERT")]
    pinned_cert: Option<PathBuf>,
}

impl Args {
    fn stream_config(&self) -> anyhow::Result<StreamConfig> {
        let mut config = StreamConfig::new(&self.endpoint)
            .with_interval(Duration::from_millis(self.interval_ms))
            .with_capture(CaptureOptions {
                quality: self.quality,
                format: self.format,
                compress: self.compress,
            });
        if let Some(path) = &self.pinned_cert {
            let der = std::fs::read(path)
                .with_context(|| format!("failed to read pinned cert {}", path.display()))?;
            config = config.with_pinned_cert(der);
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lens_stream=info")),
        )
        .init();

    let args = Args::parse();
    let config = args.stream_config()?;

    match args.source {
        Source::Replay => {
            let dir = args
                .replay_dir
                .as_ref()
                .context("--replay-dir is required with --source replay")?;
            let capture = ReplayCapture::open(dir, config.capture.format)?;
            stream(config, Arc::new(capture)).await
        }
        Source::Camera => open_camera(&config, args.camera_index).await,
    }
}

#[cfg(feature = "camera")]
async fn open_camera(config: &StreamConfig, index: u32) -> anyhow::Result<()> {
    let capture = tokio::task::spawn_blocking(move || lens_stream::WebcamCapture::open(index))
        .await
        .context("camera open task failed")??;
    stream(config.clone(), Arc::new(capture)).await
}

#[cfg(not(feature = "camera"))]
async fn open_camera(_config: &StreamConfig, _index: u32) -> anyhow::Result<()> {
    anyhow::bail!("built without the `camera` feature; use --source replay")
}

/// Run until Ctrl-C or until the link closes. There is no reconnect.
async fn stream<C: Capture>(config: StreamConfig, capture: Arc<C>) -> anyhow::Result<()> {
    let reporter: Arc<dyn ErrorReporter> = Arc::new(LogReporter);
    let manager = Arc::new(ConnectionManager::open(&config, Arc::clone(&reporter)));

    // Rejections are logged by the manager; the last prediction stays on screen.
    let renderer = ConsoleRenderer;
    manager.on_result(move |result| {
        if let PredictionResult::Classified(_) = result {
            renderer.render(Some(result));
        }
    });

    let mut capture_loop = CaptureLoop::spawn(
        Arc::clone(&manager),
        capture,
        config.capture,
        config.interval,
        reporter,
    );

    let mut link = manager.watch_link();
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for Ctrl-C")?;
            tracing::info!("Interrupted, shutting down");
        }
        _ = link.wait_for(|s| *s == LinkState::Closed) => {
            tracing::warn!("Link to {} closed; restart to reconnect", manager.endpoint());
        }
    }

    capture_loop.stop().await;
    manager.close().await;

    let stats = capture_loop.stats();
    tracing::info!(
        ticks = stats.ticks,
        sent = stats.sent,
        dropped = stats.dropped,
        skipped_busy = stats.skipped_busy,
        capture_failures = stats.capture_failures,
        "Capture loop stopped"
    );
    Ok(())
}
