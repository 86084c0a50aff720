//! TCP length + acknowledgement framing
//!
//! One connection per frame: the sender writes the payload length as a
//! 4-byte big-endian integer, waits for the receiver to answer with the
//! single byte `O`, then streams the payload and closes its half.

use super::stats::TransportCounters;
use crate::capture::FrameRef;
use crate::config::TransportConfig;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Byte the receiver sends once it is ready for the payload
pub const ACK_BYTE: u8 = b'O';

#[derive(Error, Debug)]
pub enum TcpAbort {
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),

    #[error("write failed: {0}")]
    Write(#[source] io::Error),

    #[error("read failed: {0}")]
    Read(#[source] io::Error),

    #[error("no acknowledgement within {0:?}")]
    AckTimeout(Duration),

    #[error("unexpected acknowledgement byte 0x{0:02x}")]
    BadAck(u8),

    #[error("connection closed before acknowledgement")]
    ShortRead,

    #[error("frame of {0} bytes does not fit the length prefix")]
    TooLarge(usize),
}

/// Successful TCP frame delivery
#[derive(Debug, Clone, Copy)]
pub struct Delivery {
    pub bytes: usize,
    pub elapsed: Duration,
}

/// Runs the length/ACK/payload exchange over an established stream
///
/// No payload byte is written unless the acknowledgement arrives in time
/// and equals [`ACK_BYTE`].
pub async fn deliver<S>(
    stream: &mut S,
    payload: &[u8],
    ack_timeout: Duration,
) -> Result<usize, TcpAbort>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len()).map_err(|_| TcpAbort::TooLarge(payload.len()))?;

    stream
        .write_all(&len.to_be_bytes())
        .await
        .map_err(TcpAbort::Write)?;
    stream.flush().await.map_err(TcpAbort::Write)?;

    let mut ack = [0u8; 1];
    let n = timeout(ack_timeout, stream.read(&mut ack))
        .await
        .map_err(|_| TcpAbort::AckTimeout(ack_timeout))?
        .map_err(TcpAbort::Read)?;

    if n == 0 {
        return Err(TcpAbort::ShortRead);
    }
    if ack[0] != ACK_BYTE {
        return Err(TcpAbort::BadAck(ack[0]));
    }

    stream.write_all(payload).await.map_err(TcpAbort::Write)?;
    stream.shutdown().await.map_err(TcpAbort::Write)?;

    Ok(payload.len())
}

/// Sends each frame over a fresh TCP connection
pub struct TcpTransport {
    dest: String,
    connect_timeout: Duration,
    ack_timeout: Duration,
    counters: Arc<TransportCounters>,
}

impl TcpTransport {
    pub fn new(config: &TransportConfig, counters: Arc<TransportCounters>) -> Self {
        Self {
            dest: config.destination(),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            ack_timeout: Duration::from_millis(config.ack_timeout_ms),
            counters,
        }
    }

    pub fn destination(&self) -> &str {
        &self.dest
    }

    /// Delivers one frame; the frame is released on every path
    pub async fn send_frame_tcp(&self, frame: FrameRef) -> Result<Delivery, TcpAbort> {
        let start = Instant::now();
        let result = self.exchange(frame.data()).await;
        drop(frame);

        match result {
            Ok(bytes) => {
                TransportCounters::add(&self.counters.frames_sent, 1);
                TransportCounters::add(&self.counters.bytes_sent, bytes as u64);

                let elapsed = start.elapsed();
                debug!(dest = %self.dest, bytes, ?elapsed, "TCP frame delivered");
                Ok(Delivery { bytes, elapsed })
            }
            Err(e) => {
                TransportCounters::add(&self.counters.tcp_aborts, 1);
                warn!(dest = %self.dest, error = %e, "TCP delivery aborted");
                Err(e)
            }
        }
    }

    async fn exchange(&self, payload: &[u8]) -> Result<usize, TcpAbort> {
        let mut stream = timeout(self.connect_timeout, TcpStream::connect(&self.dest))
            .await
            .map_err(|_| {
                TcpAbort::Connect(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))
            })?
            .map_err(TcpAbort::Connect)?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        deliver(&mut stream, payload, self.ack_timeout).await
    }
}
