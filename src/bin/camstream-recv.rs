//! UDP frame receiver for checking a running streamer

use anyhow::Result;
use camstream::transport::{Reassembler, HEADER_SIZE, MAX_CHUNK};
use clap::Parser;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "camstream-recv")]
#[command(about = "Reassembles camstream UDP frames and optionally saves them")]
#[command(version)]
struct Cli {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:5005")]
    bind: String,

    /// Directory to save completed frames into
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// Give up on a frame after this long without a fragment (ms)
    #[arg(long, default_value_t = 300)]
    stale_ms: u64,

    /// Maximum payload bytes per datagram
    #[arg(long, default_value_t = MAX_CHUNK)]
    max_chunk: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    fmt().with_env_filter(filter).with_target(false).init();

    if let Some(dir) = &cli.out {
        tokio::fs::create_dir_all(dir).await?;
    }

    let socket = UdpSocket::bind(&cli.bind).await?;
    info!(addr = %socket.local_addr()?, "Listening for frames");

    let stale_after = Duration::from_millis(cli.stale_ms);
    let mut rx = Reassembler::new(cli.max_chunk, stale_after);
    let mut buf = vec![0u8; HEADER_SIZE + cli.max_chunk];
    let mut saved = 0u64;

    loop {
        // Wake up regularly so stale frames are evicted even when idle
        match tokio::time::timeout(Duration::from_millis(200), socket.recv_from(&mut buf)).await {
            Ok(Ok((n, _))) => match rx.push(&buf[..n], Instant::now()) {
                Ok(Some(frame)) => {
                    info!(len = frame.len(), "Frame received");
                    if let Some(dir) = &cli.out {
                        let path = dir.join(format!("frame_{:04}.jpg", saved));
                        tokio::fs::write(&path, &frame).await?;
                        debug!(path = %path.display(), "Frame saved");
                    }
                    saved += 1;
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Frame dropped"),
            },
            Ok(Err(e)) => warn!(error = %e, "Receive failed"),
            Err(_) => {}
        }

        let evicted = rx.evict_stale(Instant::now());
        if evicted > 0 {
            warn!(evicted, pending = rx.pending(), "Frames timed out");
        }
    }
}
