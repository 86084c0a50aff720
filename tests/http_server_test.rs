//! End-to-end HTTP routes over loopback

use camstream::capture::{FrameSource, TestPatternDriver};
use camstream::config::DEFAULT_BOUNDARY;
use camstream::encoder::StreamEncoder;
use camstream::http::{serve, HttpContext};
use camstream::tier::{select_tier, PixelFormat, TierPolicy};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const EXTENDED_4MIB: u64 = 4 * 1024 * 1024;

async fn start_server(
    format: PixelFormat,
    fail_every: Option<u32>,
) -> (SocketAddr, Arc<FrameSource>) {
    start_server_with_memory(0, format, fail_every).await
}

async fn start_server_with_memory(
    extended_bytes: u64,
    format: PixelFormat,
    fail_every: Option<u32>,
) -> (SocketAddr, Arc<FrameSource>) {
    let policy = TierPolicy {
        pixel_format: format,
        ..Default::default()
    };
    let tier = select_tier(extended_bytes, &policy);
    let driver = TestPatternDriver::new(
        tier.resolution.width(),
        tier.resolution.height(),
        format,
        0,
        fail_every,
    );
    let source = Arc::new(
        FrameSource::new(tier, Box::new(driver)).with_grab_timeout(Duration::from_millis(200)),
    );
    // Continuous capture on tiers that prefer the latest frame
    let _ = source.spawn_grabber(Duration::from_millis(5));

    let ctx = Arc::new(HttpContext {
        source: Arc::clone(&source),
        encoder: StreamEncoder::new(80),
        boundary: DEFAULT_BOUNDARY.to_string(),
        capture_retry: Duration::from_millis(5),
        frame_delay: Duration::ZERO,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, ctx));
    (addr, source)
}

async fn get(addr: SocketAddr, path: &str) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(format!("GET {} HTTP/1.1\r\nHost: cam\r\n\r\n", path).as_bytes())
        .await
        .unwrap();

    let mut response = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .expect("response timed out")
        .unwrap();
    response
}

fn split_response(response: &[u8]) -> (String, &[u8]) {
    let end = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("header terminator")
        + 4;
    (String::from_utf8_lossy(&response[..end]).into_owned(), &response[end..])
}

#[tokio::test]
async fn test_jpg_route() {
    let (addr, source) = start_server(PixelFormat::Jpeg, None).await;
    let response = get(addr, "/jpg").await;
    let (head, body) = split_response(&response);

    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Content-Type: image/jpeg\r\n"));
    assert!(head.contains(&format!("Content-Length: {}\r\n", body.len())));
    assert!(body.starts_with(&[0xFF, 0xD8]));
    assert!(body.ends_with(&[0xFF, 0xD9]));
    assert_eq!(source.pool().outstanding(), 0);
}

#[tokio::test]
async fn test_jpg_from_raw_sensor() {
    let (addr, _source) = start_server(PixelFormat::Rgb565, None).await;
    let response = get(addr, "/jpg").await;
    let (head, body) = split_response(&response);

    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(body.starts_with(&[0xFF, 0xD8]));
}

#[tokio::test]
async fn test_jpg_capture_failure_is_500() {
    let (addr, source) = start_server(PixelFormat::Jpeg, Some(1)).await;
    let response = get(addr, "/jpg").await;

    assert!(response.starts_with(b"HTTP/1.1 500"));
    assert_eq!(source.pool().outstanding(), 0);
}

#[tokio::test]
async fn test_jpg_on_high_tier() {
    let (addr, source) = start_server_with_memory(EXTENDED_4MIB, PixelFormat::Jpeg, None).await;
    assert!(source.get_stats().is_continuous);

    let response = get(addr, "/jpg").await;
    let (head, body) = split_response(&response);

    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(body.starts_with(&[0xFF, 0xD8]));
    source.stop();
}

#[tokio::test]
async fn test_jpg_capture_failure_is_500_on_high_tier() {
    let (addr, source) = start_server_with_memory(EXTENDED_4MIB, PixelFormat::Jpeg, Some(1)).await;
    assert!(source.get_stats().is_continuous);

    // The grabber never produces a frame, so the request must not hang
    let response = get(addr, "/jpg").await;

    assert!(response.starts_with(b"HTTP/1.1 500"));
    assert!(source.get_stats().capture_failures > 0);
    assert_eq!(source.pool().outstanding(), 0);
    source.stop();
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let (addr, _source) = start_server(PixelFormat::Jpeg, None).await;
    let response = get(addr, "/favicon.ico").await;
    assert!(response.starts_with(b"HTTP/1.1 404 Not Found\r\n"));
}

#[tokio::test]
async fn test_stream_route() {
    let (addr, source) = start_server(PixelFormat::Jpeg, None).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"GET /stream HTTP/1.1\r\n\r\n").await.unwrap();

    let marker = format!("\r\n--{}\r\n", DEFAULT_BOUNDARY);
    let mut received = Vec::new();
    let mut buf = [0u8; 4096];

    // Read until two complete parts have started
    timeout(Duration::from_secs(5), async {
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "stream ended early");
            received.extend_from_slice(&buf[..n]);

            let parts = received
                .windows(marker.len())
                .filter(|w| *w == marker.as_bytes())
                .count();
            if parts >= 2 {
                break;
            }
        }
    })
    .await
    .expect("stream timed out");

    let text = String::from_utf8_lossy(&received);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains(&format!(
        "multipart/x-mixed-replace;boundary={}",
        DEFAULT_BOUNDARY
    )));
    assert!(text.contains("Content-Type: image/jpeg\r\nContent-Length: "));

    // Client goes away; the session must hand its buffer back
    drop(stream);
    timeout(Duration::from_secs(5), async {
        while source.pool().outstanding() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("frame buffer never released");
}
