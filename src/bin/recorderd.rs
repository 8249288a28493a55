//! recorderd - event-triggered recording daemon
//!
//! This daemon:
//! 1. Pulls the low-resolution analysis stream (RTSP, or `stub://` for demos)
//! 2. Gates frames through the mean and pixel-difference filters
//! 3. Optionally confirms motion with a person detector
//! 4. Starts and stops an external recorder on the high-resolution stream

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use event_recorder::config::RecorderConfig;
use event_recorder::detect::{load_backend, PersonDetector};
use event_recorder::gate::FrameGate;
use event_recorder::ingest::{RtspBackend, StreamSource};
use event_recorder::pipeline::Pipeline;
use event_recorder::recorder::{FfmpegLauncher, RecordingController};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Configuration file (TOML or JSON).
    #[arg(long, env = "RECORDER_CONFIG")]
    config: Option<PathBuf>,
    /// Analysis stream URL, overriding the configuration.
    #[arg(long)]
    stream_url: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = RecorderConfig::load_from(args.config.as_deref())?;
    if let Some(url) = args.stream_url {
        cfg = cfg.with_stream_url(url)?;
    }

    std::fs::create_dir_all(&cfg.recording.output_dir).with_context(|| {
        format!(
            "create output directory {}",
            cfg.recording.output_dir.display()
        )
    })?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })
        .context("install Ctrl-C handler")?;
    }

    let backend = RtspBackend::new(cfg.rtsp_config())?;
    let source =
        StreamSource::new(backend, cfg.stream_config()).with_shutdown(Arc::clone(&shutdown));
    let detector = PersonDetector::from_load(load_backend(&cfg.backend_spec()), cfg.person_config());
    let controller = RecordingController::new(
        cfg.controller_config(),
        Box::new(FfmpegLauncher::new(cfg.ffmpeg_config())),
        cfg.output_naming(),
    );

    log::info!(
        "recorderd {} starting: policy={:?} detector={} output={}",
        env!("CARGO_PKG_VERSION"),
        cfg.recording.policy,
        detector.backend_name().unwrap_or("motion-only"),
        cfg.recording.output_dir.display()
    );

    let mut pipeline = Pipeline::new(
        source,
        FrameGate::new(cfg.gate.clone()),
        detector,
        controller,
        cfg.pipeline_config(),
    );
    pipeline.run(&shutdown);

    log::info!("recorderd stopped");
    Ok(())
}
