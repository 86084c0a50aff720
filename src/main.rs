//! Camera frame streaming CLI application

// Use jemalloc for better memory management (optional feature)
#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::{Context, Result};
use camstream::capture::{CaptureError, FrameSource};
use camstream::config::Config;
use camstream::connectivity::{AlwaysUp, Supervisor};
use camstream::encoder::StreamEncoder;
use camstream::http::{self, HttpContext};
use camstream::report::{self, LogReporter, NullDetector};
use camstream::tier::select_tier;
use camstream::transport::{FrameSender, TransportCounters, TransportTask};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Delay before restarting after the camera failed to initialise
const RESTART_DELAY: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "camstream")]
#[command(about = "Memory-adaptive MJPEG/UDP/TCP streaming for constrained camera boards")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Override the detected extended memory size (bytes)
    #[arg(long)]
    extended_memory: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    fmt().with_env_filter(filter).with_target(false).init();

    info!("Camstream starting");
    info!(config_path = %cli.config, "Loading configuration");

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config))?;
    if let Some(bytes) = cli.extended_memory {
        config.memory.extended_bytes = bytes;
    }

    // Network first: every consumer needs the link
    let (mut connectivity, _link_task) = Supervisor::spawn(
        AlwaysUp,
        config.network.max_retries,
        Duration::from_millis(config.network.retry_delay_ms),
    );
    connectivity.wait_ready().await?;

    let tier = select_tier(config.memory.extended_bytes, &config.tier_policy());
    info!(
        extended_bytes = config.memory.extended_bytes,
        resolution = %tier.resolution,
        buffers = tier.buffer_count,
        location = ?tier.location,
        grab_policy = ?tier.grab_policy,
        format = ?tier.pixel_format,
        "Capture tier selected"
    );

    let source = match FrameSource::open(tier, &config.camera) {
        Ok(source) => Arc::new(source),
        Err(CaptureError::CameraInitFailed(e)) => {
            error!(error = %e, "Camera init failed, restarting");
            tokio::time::sleep(RESTART_DELAY).await;
            return restart();
        }
        Err(e) => return Err(e.into()),
    };

    let grabber = source.spawn_grabber(config.camera.capture_retry());
    let encoder = StreamEncoder::new(config.encoder.quality);
    let mut tasks = vec![];

    if config.http.enabled {
        let listener = http::bind(&config.http).await?;
        let ctx = Arc::new(HttpContext {
            source: Arc::clone(&source),
            encoder: encoder.clone(),
            boundary: config.http.boundary.clone(),
            capture_retry: config.camera.capture_retry(),
            frame_delay: Duration::from_millis(config.http.frame_delay_ms),
        });
        tasks.push(tokio::spawn(async move {
            if let Err(e) = http::serve(listener, ctx).await {
                error!(error = %e, "HTTP server failed");
            }
        }));
    }

    let counters = Arc::new(TransportCounters::default());
    match FrameSender::open(&config.transport, Arc::clone(&counters)).await {
        Ok(Some(sender)) => {
            let task = TransportTask {
                source: Arc::clone(&source),
                encoder: encoder.clone(),
                sender,
                interval: Duration::from_millis(config.transport.interval_ms),
                stats_interval: Duration::from_secs(config.transport.stats_interval_seconds),
                counters,
            };
            tasks.push(tokio::spawn(task.run()));
        }
        Ok(None) => info!("Frame transport disabled"),
        Err(e) => warn!(error = %e, "Frame transport unavailable"),
    }

    if config.report.enabled {
        tasks.push(tokio::spawn(report::run_reporter(
            Arc::clone(&source),
            NullDetector,
            LogReporter::new(config.report.url.clone()),
            Duration::from_millis(config.report.interval_ms),
        )));
    }

    // Wait for Ctrl+C
    info!("Streaming started, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    source.stop();
    if let Some(grabber) = grabber {
        let _ = grabber.await;
    }
    for task in tasks {
        task.abort();
    }

    let stats = source.get_stats();
    info!(
        captured = stats.frames_captured,
        failures = stats.capture_failures,
        recycled = stats.frames_recycled,
        "Capture stats"
    );

    Ok(())
}

/// Replaces the current process with a fresh copy of itself
fn restart() -> Result<()> {
    let exe = std::env::current_exe()?;
    let mut command = std::process::Command::new(exe);
    command.args(std::env::args_os().skip(1));

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        Err(command.exec().into())
    }

    #[cfg(not(unix))]
    {
        let status = command.status()?;
        std::process::exit(status.code().unwrap_or(1));
    }
}
