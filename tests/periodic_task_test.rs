//! Periodic transport and reporter loops keep running through per-frame
//! failures and stop once the frame source shuts down

use camstream::capture::{FrameRef, FrameSource, TestPatternDriver};
use camstream::config::{TransportConfig, TransportMode};
use camstream::encoder::StreamEncoder;
use camstream::report::{run_reporter, BoundingBox, Detector, ReportError, Reporter};
use camstream::tier::{select_tier, PixelFormat, TierPolicy};
use camstream::transport::{FrameSender, Reassembler, TransportCounters, TransportTask};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::timeout;

/// Low-tier JPEG source whose every `fail_every`th grab fails
fn flaky_source(fail_every: u32) -> Arc<FrameSource> {
    let tier = select_tier(0, &TierPolicy::default());
    let driver = TestPatternDriver::new(320, 240, PixelFormat::Jpeg, 0, Some(fail_every));
    Arc::new(FrameSource::new(tier, Box::new(driver)))
}

fn transport_config(mode: TransportMode, dest_port: u16) -> TransportConfig {
    TransportConfig {
        mode,
        dest_host: "127.0.0.1".to_string(),
        dest_port,
        interval_ms: 10,
        ack_timeout_ms: 200,
        connect_timeout_ms: 500,
        ..Default::default()
    }
}

async fn spawn_transport(
    config: &TransportConfig,
    source: &Arc<FrameSource>,
) -> (tokio::task::JoinHandle<()>, Arc<TransportCounters>) {
    let counters = Arc::new(TransportCounters::default());
    let sender = FrameSender::open(config, Arc::clone(&counters))
        .await
        .unwrap()
        .expect("transport enabled");

    let task = TransportTask {
        source: Arc::clone(source),
        encoder: StreamEncoder::new(80),
        sender,
        interval: Duration::from_millis(config.interval_ms),
        stats_interval: Duration::from_millis(50),
        counters: Arc::clone(&counters),
    };

    (tokio::spawn(task.run()), counters)
}

#[tokio::test]
async fn test_udp_transport_survives_capture_failures() {
    let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = receiver.local_addr().unwrap().port();

    let source = flaky_source(2);
    let config = transport_config(TransportMode::Udp, port);
    let (handle, counters) = spawn_transport(&config, &source).await;

    let mut rx = Reassembler::default();
    let mut buf = vec![0u8; 2048];
    let mut frames = 0;

    timeout(Duration::from_secs(5), async {
        while frames < 3 {
            let n = receiver.recv(&mut buf).await.unwrap();
            if let Ok(Some(frame)) = rx.push(&buf[..n], Instant::now()) {
                assert!(frame.starts_with(&[0xFF, 0xD8]));
                frames += 1;
            }
        }
    })
    .await
    .expect("frames stopped arriving");

    let stats = counters.snapshot();
    assert!(stats.frames_sent >= 3);
    assert!(stats.frames_dropped > 0);

    source.stop();
    timeout(Duration::from_secs(2), handle)
        .await
        .expect("transport task did not stop")
        .unwrap();
    assert_eq!(source.pool().outstanding(), 0);
}

#[tokio::test]
async fn test_tcp_transport_survives_aborts() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let payload_bytes = Arc::new(AtomicUsize::new(0));

    // Peer that answers every length prefix with the wrong ACK byte
    let seen = Arc::clone(&payload_bytes);
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            let seen = Arc::clone(&seen);
            tokio::spawn(async move {
                let mut len = [0u8; 4];
                stream.read_exact(&mut len).await.unwrap();
                stream.write_all(b"X").await.unwrap();

                let mut rest = Vec::new();
                let _ = stream.read_to_end(&mut rest).await;
                seen.fetch_add(rest.len(), Ordering::SeqCst);
            });
        }
    });

    let source = flaky_source(3);
    let config = transport_config(TransportMode::Tcp, port);
    let (handle, counters) = spawn_transport(&config, &source).await;

    timeout(Duration::from_secs(5), async {
        while counters.snapshot().tcp_aborts < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("transport stalled after an abort");

    source.stop();
    timeout(Duration::from_secs(2), handle)
        .await
        .expect("transport task did not stop")
        .unwrap();

    let stats = counters.snapshot();
    assert_eq!(stats.frames_sent, 0);
    assert!(stats.frames_dropped > 0);
    assert_eq!(payload_bytes.load(Ordering::SeqCst), 0);
}

struct OneBox;

impl Detector for OneBox {
    fn detect(&mut self, _frame: &FrameRef) -> Vec<BoundingBox> {
        vec![BoundingBox {
            x: 1.0,
            y: 2.0,
            width: 3.0,
            height: 4.0,
        }]
    }
}

#[derive(Clone, Default)]
struct Collect(Arc<Mutex<Vec<String>>>);

impl Reporter for Collect {
    async fn post_json(&self, payload: String) -> Result<(), ReportError> {
        self.0.lock().unwrap().push(payload);
        Ok(())
    }
}

#[tokio::test]
async fn test_reporter_survives_capture_failures_and_stops() {
    let source = flaky_source(2);
    let reporter = Collect::default();
    let posted = reporter.clone();

    let handle = tokio::spawn(run_reporter(
        Arc::clone(&source),
        OneBox,
        reporter,
        Duration::from_millis(10),
    ));

    timeout(Duration::from_secs(5), async {
        while posted.0.lock().unwrap().len() < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("reporter stalled after a capture failure");

    assert!(source.get_stats().capture_failures > 0);

    source.stop();
    timeout(Duration::from_secs(2), handle)
        .await
        .expect("reporter did not stop")
        .unwrap();
    assert_eq!(source.pool().outstanding(), 0);
}
