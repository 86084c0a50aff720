//! Push transport to a fixed remote endpoint
//!
//! A periodic task captures a frame, makes sure it is JPEG, and hands it to
//! either the UDP fragment sender or the TCP length+ACK sender. Per-frame
//! failures are counted and logged; the task only stops when the frame
//! source shuts down.

mod packet;
pub mod reassembly;
mod stats;
mod tcp;
mod udp;

pub use packet::{decode_datagram, PacketError, PacketHeader, HEADER_SIZE, MAX_CHUNK};
pub use reassembly::{Reassembler, ReassemblyError, ReassemblyStats, DEFAULT_STALE_AFTER};
pub use stats::{TransportCounters, TransportStats};
pub use tcp::{deliver, Delivery, TcpAbort, TcpTransport, ACK_BYTE};
pub use udp::{fragment, UdpDelivery, UdpTransport};

use crate::capture::{CaptureError, FrameRef, FrameSource, PoolError};
use crate::config::{TransportConfig, TransportMode};
use crate::encoder::StreamEncoder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid destination: {0}")]
    InvalidDestination(String),

    #[error("empty frame")]
    EmptyFrame,

    #[error("frame of {len} bytes needs more than 65535 packets of {max_chunk} bytes")]
    TooManyPackets { len: usize, max_chunk: usize },

    #[error("TCP delivery aborted: {0}")]
    Tcp(#[from] TcpAbort),
}

pub(crate) async fn resolve(dest: &str) -> Result<SocketAddr, TransportError> {
    tokio::net::lookup_host(dest)
        .await
        .map_err(|e| TransportError::InvalidDestination(format!("{}: {}", dest, e)))?
        .next()
        .ok_or_else(|| TransportError::InvalidDestination(dest.to_string()))
}

/// The configured sender
pub enum FrameSender {
    Udp(UdpTransport),
    Tcp(TcpTransport),
}

impl FrameSender {
    /// Builds the sender for `config.mode`, `None` when the transport is off
    pub async fn open(
        config: &TransportConfig,
        counters: Arc<TransportCounters>,
    ) -> Result<Option<Self>, TransportError> {
        match config.mode {
            TransportMode::Off => Ok(None),
            TransportMode::Udp => Ok(Some(FrameSender::Udp(
                UdpTransport::bind(config, counters).await?,
            ))),
            TransportMode::Tcp => Ok(Some(FrameSender::Tcp(TcpTransport::new(config, counters)))),
        }
    }

    pub async fn send(&mut self, frame: FrameRef) -> Result<(), TransportError> {
        match self {
            FrameSender::Udp(udp) => udp.send_frame_udp(frame).await.map(|_| ()),
            FrameSender::Tcp(tcp) => {
                tcp.send_frame_tcp(frame).await.map(|_| ()).map_err(Into::into)
            }
        }
    }

    fn mode(&self) -> &'static str {
        match self {
            FrameSender::Udp(_) => "udp",
            FrameSender::Tcp(_) => "tcp",
        }
    }
}

/// Periodic capture-and-send loop
pub struct TransportTask {
    pub source: Arc<FrameSource>,
    pub encoder: StreamEncoder,
    pub sender: FrameSender,
    pub interval: Duration,
    pub stats_interval: Duration,
    pub counters: Arc<TransportCounters>,
}

impl TransportTask {
    pub async fn run(mut self) {
        info!(
            mode = self.sender.mode(),
            interval = ?self.interval,
            "Frame transport started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_report = Instant::now();
        let mut previous = self.counters.snapshot();

        loop {
            ticker.tick().await;

            let frame = match self.source.capture().await {
                Ok(frame) => frame,
                Err(CaptureError::Pool(PoolError::Closed)) => break,
                Err(e) => {
                    warn!(error = %e, "Camera capture failed");
                    TransportCounters::add(&self.counters.frames_dropped, 1);
                    continue;
                }
            };

            let frame = match self.encoder.encode(frame).await {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "JPEG compression failed");
                    TransportCounters::add(&self.counters.frames_dropped, 1);
                    continue;
                }
            };

            match self.sender.send(frame).await {
                Ok(()) => {}
                Err(TransportError::EmptyFrame) => debug!("Skipping empty frame"),
                // TCP aborts are logged by the sender
                Err(TransportError::Tcp(_)) => {}
                Err(e) => warn!(error = %e, "Frame send failed"),
            }

            let elapsed = last_report.elapsed();
            if elapsed >= self.stats_interval {
                let stats = self.counters.snapshot();
                let secs = elapsed.as_secs_f64();

                info!(
                    sent = stats.frames_sent,
                    dropped = stats.frames_dropped,
                    send_errors = stats.send_errors,
                    tcp_aborts = stats.tcp_aborts,
                    packets = stats.packets_sent,
                    fps = %format!("{:.1}", stats.calculate_fps(&previous, secs)),
                    kbps = %format!("{:.0}", stats.calculate_bitrate_kbps(&previous, secs)),
                    "Transport stats"
                );

                previous = stats;
                last_report = Instant::now();
            }
        }

        info!("Frame transport stopped");
    }
}
