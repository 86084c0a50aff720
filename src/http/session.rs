//! Per-connection MJPEG streaming session

use crate::capture::{CaptureError, FrameRef, FrameSource, PoolError};
use crate::encoder::StreamEncoder;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("client write failed: {0}")]
    Write(#[from] io::Error),

    #[error("session closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Streaming,
    Closed,
}

/// Why [`StreamSession::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// A write to the client failed
    ClientGone,
    /// The frame source shut down
    SourceClosed,
}

/// One `multipart/x-mixed-replace` response
///
/// Every part is written as three separate writes: the boundary line, the
/// part headers, and the JPEG body. The first failing write closes the
/// session; nothing is written afterwards.
pub struct StreamSession<W> {
    writer: W,
    boundary: String,
    state: SessionState,
    frames_sent: u64,
}

impl<W: AsyncWrite + Unpin> StreamSession<W> {
    pub fn new(writer: W, boundary: impl Into<String>) -> Self {
        Self {
            writer,
            boundary: boundary.into(),
            state: SessionState::Streaming,
            frames_sent: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    /// Writes the status line and stream headers
    pub async fn write_preamble(&mut self) -> Result<(), SessionError> {
        let head = format!(
            "HTTP/1.1 200 OK\r\n\
             Content-Type: multipart/x-mixed-replace;boundary={}\r\n\
             Access-Control-Allow-Origin: *\r\n\
             Cache-Control: no-cache\r\n\
             Connection: close\r\n\r\n",
            self.boundary
        );
        self.write(head.as_bytes()).await
    }

    /// Emits `frame` as one part and releases it
    ///
    /// The frame is released on every path, including writes that fail
    /// and sessions that are already closed.
    pub async fn send_frame(&mut self, frame: FrameRef) -> Result<(), SessionError> {
        let boundary = format!("\r\n--{}\r\n", self.boundary);
        let header = format!(
            "Content-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
            frame.len()
        );

        self.write(boundary.as_bytes()).await?;
        self.write(header.as_bytes()).await?;
        self.write(frame.data()).await?;
        drop(frame);

        self.frames_sent += 1;
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }

        if let Err(e) = self.writer.write_all(bytes).await {
            self.state = SessionState::Closed;
            return Err(e.into());
        }
        Ok(())
    }

    /// Streams frames until the client goes away or the source stops
    ///
    /// Capture failures are retried after `retry_delay`; frames that fail
    /// to encode are skipped.
    pub async fn run(
        &mut self,
        source: &FrameSource,
        encoder: &StreamEncoder,
        retry_delay: Duration,
        frame_delay: Duration,
    ) -> SessionEnd {
        loop {
            let frame = match source.capture().await {
                Ok(frame) => frame,
                Err(CaptureError::Pool(PoolError::Closed)) => {
                    self.state = SessionState::Closed;
                    return SessionEnd::SourceClosed;
                }
                Err(e) => {
                    warn!(error = %e, "Camera capture failed");
                    tokio::time::sleep(retry_delay).await;
                    continue;
                }
            };

            let frame = match encoder.encode(frame).await {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "JPEG compression failed");
                    continue;
                }
            };

            let len = frame.len();
            if let Err(e) = self.send_frame(frame).await {
                debug!(error = %e, frames = self.frames_sent, "Stream client gone");
                return SessionEnd::ClientGone;
            }
            debug!(len, "MJPG part sent");

            if !frame_delay.is_zero() {
                tokio::time::sleep(frame_delay).await;
            }
        }
    }
}
