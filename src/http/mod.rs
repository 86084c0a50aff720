//! MJPEG HTTP publisher
//!
//! A deliberately small HTTP/1.1 server on a raw `TcpListener`: one request
//! per connection, three routes, no keep-alive.
//!
//! | Route              | Response                                   |
//! |--------------------|--------------------------------------------|
//! | `GET /`, `/stream` | endless `multipart/x-mixed-replace` stream |
//! | `GET /jpg`         | one JPEG, or `500` if none could be made   |
//! | anything else      | `404`                                      |

mod session;

pub use session::{SessionEnd, SessionError, SessionState, StreamSession};

use crate::capture::FrameSource;
use crate::config::HttpConfig;
use crate::encoder::StreamEncoder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_REQUEST: usize = 4096;

/// Request target after parsing the request line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Stream,
    Jpg,
    NotFound,
}

impl Route {
    /// Maps a raw request head to a route
    pub fn parse(request: &str) -> Self {
        let mut parts = request.lines().next().unwrap_or("").split_whitespace();
        let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
            return Route::NotFound;
        };

        if method != "GET" {
            return Route::NotFound;
        }

        let path = target.split('?').next().unwrap_or(target);
        match path {
            "/" | "/stream" => Route::Stream,
            "/jpg" => Route::Jpg,
            _ => Route::NotFound,
        }
    }
}

/// Shared state for every HTTP connection
pub struct HttpContext {
    pub source: Arc<FrameSource>,
    pub encoder: StreamEncoder,
    pub boundary: String,
    pub capture_retry: Duration,
    pub frame_delay: Duration,
}

/// Binds the configured address
pub async fn bind(config: &HttpConfig) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind((config.bind.as_str(), config.port)).await?;
    info!(addr = %listener.local_addr()?, "HTTP server listening");
    Ok(listener)
}

/// Accepts connections forever, one task per client
pub async fn serve(listener: TcpListener, ctx: Arc<HttpContext>) -> std::io::Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "Accept failed");
                continue;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            handle_connection(stream, peer, &ctx).await;
        });
    }
}

async fn handle_connection<S>(mut stream: S, peer: SocketAddr, ctx: &HttpContext)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = match read_request(&mut stream).await {
        Ok(request) => request,
        Err(e) => {
            debug!(peer = %peer, error = %e, "Failed to read request");
            return;
        }
    };

    match Route::parse(&request) {
        Route::Stream => {
            info!(peer = %peer, "Stream client connected");
            let mut session = StreamSession::new(stream, ctx.boundary.as_str());
            if session.write_preamble().await.is_err() {
                return;
            }

            let end = session
                .run(&ctx.source, &ctx.encoder, ctx.capture_retry, ctx.frame_delay)
                .await;
            info!(peer = %peer, frames = session.frames_sent(), reason = ?end, "Stream closed");
        }
        Route::Jpg => {
            if let Err(e) = serve_jpg(&mut stream, ctx).await {
                debug!(peer = %peer, error = %e, "JPG response failed");
            }
        }
        Route::NotFound => {
            let _ = stream.write_all(not_found().as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    }
}

async fn read_request<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<String> {
    let mut buf = vec![0u8; MAX_REQUEST];
    let mut filled = 0;

    while filled < buf.len() {
        let n = timeout(REQUEST_TIMEOUT, stream.read(&mut buf[filled..]))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "request timed out"))??;
        if n == 0 {
            break;
        }
        filled += n;
        if buf[..filled].windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }

    Ok(String::from_utf8_lossy(&buf[..filled]).into_owned())
}

/// Writes one JPEG, or `500` when capture or compression fails
async fn serve_jpg<S: AsyncWrite + Unpin>(
    stream: &mut S,
    ctx: &HttpContext,
) -> std::io::Result<()> {
    let frame = match ctx.source.capture().await {
        Ok(frame) => match ctx.encoder.encode(frame).await {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "JPEG compression failed");
                return write_error(stream).await;
            }
        },
        Err(e) => {
            warn!(error = %e, "Camera capture failed");
            return write_error(stream).await;
        }
    };

    let head = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: image/jpeg\r\n\
         Content-Disposition: inline; filename=capture.jpg\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n",
        frame.len()
    );

    stream.write_all(head.as_bytes()).await?;
    stream.write_all(frame.data()).await?;
    drop(frame);
    stream.shutdown().await
}

async fn write_error<S: AsyncWrite + Unpin>(stream: &mut S) -> std::io::Result<()> {
    stream
        .write_all(b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
        .await?;
    stream.shutdown().await
}

fn not_found() -> String {
    let body = "404 Not Found\n";
    format!(
        "HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    )
}
