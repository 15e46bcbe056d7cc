//! deskrec: records the primary desktop into an H.264/H.265 MP4 file.
//!
//! # Architecture
//!
//! ```text
//! DXGI Desktop Duplication (or synthetic pattern)
//!   │  acquire → staging copy → map
//!   ▼
//! SampleBuilder (strip pitch, flip rows, stamp 100 ns timestamps)
//!   │
//!   ▼
//! GStreamer: appsrc → videoflip → encoder → parser → mp4mux → filesink
//! ```
//!
//! The recording loop runs on a blocking thread; progress comes back over an mpsc channel.
//!
//! Usage: `deskrec [config.json]`. Without an argument the defaults record five seconds of
//! the desktop at 30 fps into `output.mp4`.

mod encoder;

use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use deskrec_capture_windows::{DesktopDuplication, SessionScaffold, SyntheticSource};
use deskrec_core::{
    CapturePipeline, ErrorCategory, FrameTransfer, PipelineState, PipelineStatus, RecorderConfig,
    RecorderError, RecordingSummary, Resolution, SourceKind,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use crate::encoder::GstEncodeSink;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("deskrec v{}", env!("CARGO_PKG_VERSION"));

    match run().await {
        Ok(summary) => {
            info!(
                "Recording complete: {} frames written, {} acquisitions timed out",
                summary.frames_written, summary.frames_skipped
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Recording failed: {e:#}");
            let code = e
                .downcast_ref::<RecorderError>()
                .map_or(ErrorCategory::Other.exit_code(), RecorderError::exit_code);
            ExitCode::from(code)
        }
    }
}

async fn run() -> Result<RecordingSummary> {
    let config = match std::env::args_os().nth(1) {
        Some(path) => RecorderConfig::from_json_file(&path)
            .with_context(|| format!("loading {}", Path::new(&path).display()))?,
        None => RecorderConfig::default(),
    };
    config.validate()?;

    info!(
        "Recording {} frames ({}s @{}fps, {} at {}kbps) → {}",
        config.frame_count(),
        config.duration_secs,
        config.target_fps,
        config.codec,
        config.bitrate_bps / 1000,
        config.output_path.display()
    );

    let (status_tx, mut status_rx) = mpsc::channel::<PipelineStatus>(64);
    let recording = tokio::task::spawn_blocking(move || record(config, status_tx));

    // Ends when the pipeline, and with it the sender, is dropped.
    let mut last_state = PipelineState::Idle;
    while let Some(status) = status_rx.recv().await {
        if status.state != last_state {
            info!("Pipeline → {:?}", status.state);
            last_state = status.state.clone();
        } else {
            debug!(
                "Iteration {}: {} written, {} skipped",
                status.iteration, status.frames_written, status.frames_skipped
            );
        }
    }

    let summary = recording.await.context("recording thread panicked")??;
    Ok(summary)
}

/// Blocking body of a recording: process scaffolding, source selection, pipeline run.
fn record(
    config: RecorderConfig,
    status_tx: mpsc::Sender<PipelineStatus>,
) -> Result<RecordingSummary, RecorderError> {
    let _session = SessionScaffold::enter()?;

    match config.source {
        SourceKind::Desktop => {
            let source = DesktopDuplication::open_first_attached()?;
            drive(config, source, status_tx)
        }
        SourceKind::Synthetic { width, height, row_padding } => {
            let interval = Duration::from_nanos(1_000_000_000 / u64::from(config.target_fps.max(1)));
            let source = SyntheticSource::new(Resolution::new(width, height), row_padding)
                .with_frame_interval(interval);
            drive(config, source, status_tx)
        }
    }
}

fn drive<S: FrameTransfer>(
    config: RecorderConfig,
    source: S,
    status_tx: mpsc::Sender<PipelineStatus>,
) -> Result<RecordingSummary, RecorderError> {
    CapturePipeline::new(config, source)
        .with_status(status_tx)
        .run(GstEncodeSink::open)
}
