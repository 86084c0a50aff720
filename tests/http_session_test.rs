//! MJPEG session behaviour under client write failures

use bytes::BufMut;
use camstream::capture::{CaptureBufferPool, FrameInfo, FrameRef, FrameSource, TestPatternDriver};
use camstream::encoder::StreamEncoder;
use camstream::http::{SessionEnd, SessionError, SessionState, StreamSession};
use camstream::tier::{
    select_tier, GrabPolicy, MemoryLocation, PixelFormat, Resolution, Tier, TierPolicy,
};
use std::io;
use std::time::Duration;
use tokio_test::io::Builder;

const BOUNDARY: &str = "123456789000000000000987654321";

fn pool() -> CaptureBufferPool {
    CaptureBufferPool::new(Tier {
        resolution: Resolution::Qvga,
        buffer_count: 2,
        location: MemoryLocation::OnChip,
        grab_policy: GrabPolicy::WaitForFree,
        pixel_format: PixelFormat::Jpeg,
    })
}

fn pool_frame(pool: &CaptureBufferPool, body: &[u8]) -> FrameRef {
    let mut guard = pool.try_reserve().unwrap().expect("free buffer");
    guard.buffer_mut().put_slice(body);
    guard.into_frame(FrameInfo {
        width: 320,
        height: 240,
        format: PixelFormat::Jpeg,
    })
}

fn boundary_line() -> String {
    format!("\r\n--{}\r\n", BOUNDARY)
}

fn part_header(len: usize) -> String {
    format!("Content-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n", len)
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "client reset")
}

#[tokio::test]
async fn test_parts_written_in_order() {
    let pool = pool();
    let mock = Builder::new()
        .write(boundary_line().as_bytes())
        .write(part_header(3).as_bytes())
        .write(b"abc")
        .write(boundary_line().as_bytes())
        .write(part_header(2).as_bytes())
        .write(b"de")
        .build();

    let mut session = StreamSession::new(mock, BOUNDARY);
    session.send_frame(pool_frame(&pool, b"abc")).await.unwrap();
    session.send_frame(pool_frame(&pool, b"de")).await.unwrap();

    assert_eq!(session.frames_sent(), 2);
    assert_eq!(session.state(), SessionState::Streaming);
    assert_eq!(pool.outstanding(), 0);
}

#[tokio::test]
async fn test_preamble_headers() {
    let mut session = StreamSession::new(Vec::new(), BOUNDARY);
    session.write_preamble().await.unwrap();

    let head = String::from_utf8(session.into_inner()).unwrap();
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains(&format!(
        "Content-Type: multipart/x-mixed-replace;boundary={}\r\n",
        BOUNDARY
    )));
    assert!(head.contains("Connection: close\r\n"));
    assert!(head.ends_with("\r\n\r\n"));
}

async fn assert_failure_closes(mock: tokio_test::io::Mock) {
    let pool = pool();
    let mut session = StreamSession::new(mock, BOUNDARY);

    let err = session.send_frame(pool_frame(&pool, b"abc")).await.unwrap_err();
    assert!(matches!(err, SessionError::Write(_)));
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(pool.outstanding(), 0);
    assert_eq!(pool.stats().released, 1);

    // Closed sessions release without touching the socket
    let err = session.send_frame(pool_frame(&pool, b"xyz")).await.unwrap_err();
    assert!(matches!(err, SessionError::Closed));
    assert_eq!(pool.outstanding(), 0);
    assert_eq!(session.frames_sent(), 0);
}

#[tokio::test]
async fn test_boundary_write_failure() {
    let mock = Builder::new().write_error(broken_pipe()).build();
    assert_failure_closes(mock).await;
}

#[tokio::test]
async fn test_header_write_failure() {
    let mock = Builder::new()
        .write(boundary_line().as_bytes())
        .write_error(broken_pipe())
        .build();
    assert_failure_closes(mock).await;
}

#[tokio::test]
async fn test_body_write_failure() {
    let mock = Builder::new()
        .write(boundary_line().as_bytes())
        .write(part_header(3).as_bytes())
        .write_error(broken_pipe())
        .build();
    assert_failure_closes(mock).await;
}

fn pattern_source(fail_every: Option<u32>) -> FrameSource {
    let tier = select_tier(0, &TierPolicy::default());
    let driver = TestPatternDriver::new(320, 240, PixelFormat::Jpeg, 0, fail_every);
    FrameSource::new(tier, Box::new(driver))
}

#[tokio::test]
async fn test_run_ends_when_client_gone() {
    let source = pattern_source(None);
    let encoder = StreamEncoder::new(80);
    let mock = Builder::new().write_error(broken_pipe()).build();

    let mut session = StreamSession::new(mock, BOUNDARY);
    let end = session
        .run(&source, &encoder, Duration::from_millis(1), Duration::ZERO)
        .await;

    assert_eq!(end, SessionEnd::ClientGone);
    assert_eq!(source.pool().outstanding(), 0);
}

#[tokio::test]
async fn test_run_retries_capture_failures() {
    // Every other grab fails; the session keeps going until the write fails
    let source = pattern_source(Some(2));
    let encoder = StreamEncoder::new(80);

    let mut session = StreamSession::new(Vec::new(), BOUNDARY);
    for _ in 0..3 {
        let frame = source.capture().await;
        if let Ok(frame) = frame {
            session.send_frame(frame).await.unwrap();
        }
    }
    assert_eq!(session.frames_sent(), 2);

    let mock = Builder::new().write_error(broken_pipe()).build();
    let mut session = StreamSession::new(mock, BOUNDARY);
    let end = session
        .run(&source, &encoder, Duration::from_millis(1), Duration::ZERO)
        .await;
    assert_eq!(end, SessionEnd::ClientGone);
    assert!(source.get_stats().capture_failures >= 1);
    assert_eq!(source.pool().outstanding(), 0);
}

#[tokio::test]
async fn test_run_ends_when_source_stops() {
    let source = pattern_source(None);
    source.stop();

    let mut session = StreamSession::new(Vec::new(), BOUNDARY);
    let end = session
        .run(&source, &StreamEncoder::new(80), Duration::from_millis(1), Duration::ZERO)
        .await;

    assert_eq!(end, SessionEnd::SourceClosed);
    assert_eq!(session.state(), SessionState::Closed);
}
