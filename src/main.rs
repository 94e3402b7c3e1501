//! Frame-daemon binary: capture JPEG frames and optionally save snapshots.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use frame_daemon::validation::{jpeg_dimensions, validate_jpeg};
use frame_daemon::{CaptureConfig, CaptureSession, FileConfig, Frame};
use tracing::{info, warn};

/// Capture JPEG frames from a V4L2 device.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// TOML configuration file with a `[capture]` table.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Device node, e.g. /dev/video0.
    #[arg(short, long)]
    device: Option<PathBuf>,

    /// Requested frame width.
    #[arg(long)]
    width: Option<u32>,

    /// Requested frame height.
    #[arg(long)]
    height: Option<u32>,

    /// Milliseconds between snapshots.
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    /// Stop after this many snapshots.
    #[arg(short = 'n', long)]
    frames: Option<u64>,

    /// Directory to write snapshots into.
    #[arg(short, long)]
    output: Option<PathBuf>,
}

impl Args {
    fn capture_config(&self) -> Result<CaptureConfig> {
        let mut config = match &self.config {
            Some(path) => FileConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?
                .capture,
            None => CaptureConfig::default(),
        };
        if let Some(device) = &self.device {
            config.device.clone_from(device);
        }
        if let Some(width) = self.width {
            config.width = width;
        }
        if let Some(height) = self.height {
            config.height = height;
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run(&Args::parse()) {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<()> {
    let config = args.capture_config()?;
    if let Some(dir) = &args.output {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating output directory {}", dir.display()))?;
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        if let Err(err) = ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst)) {
            warn!("failed to install Ctrl+C handler: {err}");
        }
    }

    let mut session = CaptureSession::launch(config).context("starting capture session")?;
    if let Some(format) = session.format() {
        info!(
            device = %session.config().device.display(),
            width = format.width,
            height = format.height,
            fourcc = %format.fourcc,
            "capture started"
        );
    }

    let interval = Duration::from_millis(args.interval_ms);
    let mut taken = 0u64;
    let outcome = loop {
        if shutdown.load(Ordering::SeqCst) || args.frames.is_some_and(|limit| taken >= limit) {
            break Ok(());
        }

        let frame = match session.get_frame() {
            Ok(frame) => frame,
            Err(err) => break Err(err).context("reading frame"),
        };
        report(&frame);
        if let Some(dir) = &args.output {
            let path = dir.join(format!("frame-{:06}.jpg", frame.metadata.sequence));
            if let Err(err) = std::fs::write(&path, frame.into_bytes()) {
                break Err(err).with_context(|| format!("writing {}", path.display()));
            }
        }
        taken += 1;

        sleep_unless(&shutdown, interval);
    };

    session.stop();
    info!(snapshots = taken, "capture finished");
    outcome
}

fn report(frame: &Frame) {
    let sequence = frame.metadata.sequence;
    match validate_jpeg(frame.as_bytes()) {
        Ok(()) => {
            let (width, height) = jpeg_dimensions(frame.as_bytes()).unwrap_or_default();
            info!(
                sequence,
                bytes = frame.len(),
                width,
                height,
                age_ms = frame.age().as_millis(),
                "snapshot"
            );
        }
        Err(err) => warn!(sequence, bytes = frame.len(), "invalid JPEG frame: {err}"),
    }
}

/// Sleep for `duration`, waking early on shutdown.
fn sleep_unless(shutdown: &AtomicBool, duration: Duration) {
    let deadline = Instant::now() + duration;
    while !shutdown.load(Ordering::SeqCst) {
        let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
            return;
        };
        thread::sleep(remaining.min(Duration::from_millis(50)));
    }
}
