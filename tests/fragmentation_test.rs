//! UDP fragmentation and reassembly over loopback

use bytes::Bytes;
use camstream::capture::{FrameInfo, FrameRef};
use camstream::config::{TransportConfig, TransportMode};
use camstream::tier::PixelFormat;
use camstream::transport::{
    decode_datagram, fragment, PacketHeader, Reassembler, TransportCounters, TransportError,
    UdpTransport, HEADER_SIZE, MAX_CHUNK,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::timeout;

/// Helper to create test JPEG with SOI/EOI markers
fn create_test_jpeg(len: usize) -> Vec<u8> {
    let mut jpeg = vec![0xFF, 0xD8];
    jpeg.extend((0..len - 4).map(|i| (i % 251) as u8));
    jpeg.extend(&[0xFF, 0xD9]);
    jpeg
}

fn jpeg_frame(data: Vec<u8>) -> FrameRef {
    FrameRef::from_bytes(
        Bytes::from(data),
        FrameInfo {
            width: 320,
            height: 240,
            format: PixelFormat::Jpeg,
        },
    )
}

async fn udp_pair() -> (UdpTransport, UdpSocket, Arc<TransportCounters>) {
    let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let config = TransportConfig {
        mode: TransportMode::Udp,
        dest_host: "127.0.0.1".to_string(),
        dest_port: receiver.local_addr().unwrap().port(),
        ..Default::default()
    };

    let counters = Arc::new(TransportCounters::default());
    let sender = UdpTransport::bind(&config, Arc::clone(&counters)).await.unwrap();
    (sender, receiver, counters)
}

async fn recv(socket: &UdpSocket) -> Vec<u8> {
    let mut buf = vec![0u8; HEADER_SIZE + MAX_CHUNK];
    let (n, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .expect("datagram timed out")
        .unwrap();
    buf.truncate(n);
    buf
}

#[test]
fn test_2500_byte_frame_makes_three_packets() {
    let frame = create_test_jpeg(2500);
    let packets = fragment(0, &frame, MAX_CHUNK).unwrap();
    assert_eq!(packets.len(), 3);

    let mut joined = Vec::new();
    for (i, (packet, expected)) in packets.iter().zip([1024usize, 1024, 452]).enumerate() {
        let (header, payload) = decode_datagram(packet, MAX_CHUNK).unwrap();
        assert_eq!(
            header,
            PacketHeader {
                frame_id: 0,
                packet_index: i as u16,
                total_packets: 3,
                payload_len: expected as u16,
            }
        );
        joined.extend_from_slice(payload);
    }
    assert_eq!(joined, frame);
}

#[test]
fn test_packet_count_is_ceiling() {
    for len in [1usize, 1023, 1024, 1025, 4096, 10_000] {
        let packets = fragment(1, &vec![0u8; len], MAX_CHUNK).unwrap();
        assert_eq!(packets.len(), len.div_ceil(MAX_CHUNK), "len {}", len);
        let payload: usize = packets.iter().map(|p| p.len() - HEADER_SIZE).sum();
        assert_eq!(payload, len);
    }
}

#[tokio::test]
async fn test_loopback_reassembly() {
    let (mut sender, receiver, counters) = udp_pair().await;
    let frame = create_test_jpeg(2500);

    let delivery = sender.send_frame_udp(jpeg_frame(frame.clone())).await.unwrap();
    assert_eq!(delivery.packets, 3);
    assert_eq!(delivery.failed, 0);

    let mut rx = Reassembler::default();
    let mut done = None;
    for _ in 0..3 {
        let datagram = recv(&receiver).await;
        if let Some(frame) = rx.push(&datagram, Instant::now()).unwrap() {
            done = Some(frame);
        }
    }

    assert_eq!(&done.expect("frame completed")[..], &frame[..]);
    let stats = counters.snapshot();
    assert_eq!(stats.frames_sent, 1);
    assert_eq!(stats.packets_sent, 3);
    assert_eq!(stats.bytes_sent, 2500);
}

#[tokio::test]
async fn test_frame_id_advances_once_per_frame() {
    let (mut sender, receiver, _) = udp_pair().await;

    for expected in 0..3u16 {
        let delivery = sender.send_frame_udp(jpeg_frame(create_test_jpeg(2000))).await.unwrap();
        assert_eq!(delivery.frame_id, expected);

        for _ in 0..2 {
            let header = PacketHeader::from_bytes(&recv(&receiver).await).unwrap();
            assert_eq!(header.frame_id, expected);
        }
    }
}

#[tokio::test]
async fn test_empty_frame_skipped_without_id() {
    let (mut sender, receiver, _) = udp_pair().await;

    let err = sender.send_frame_udp(jpeg_frame(Vec::new())).await.unwrap_err();
    assert!(matches!(err, TransportError::EmptyFrame));

    let delivery = sender.send_frame_udp(jpeg_frame(create_test_jpeg(100))).await.unwrap();
    assert_eq!(delivery.frame_id, 0);
    let header = PacketHeader::from_bytes(&recv(&receiver).await).unwrap();
    assert_eq!(header.total_packets, 1);
}

#[tokio::test]
async fn test_lost_fragment_goes_stale() {
    let frame = create_test_jpeg(2500);
    let packets = fragment(7, &frame, MAX_CHUNK).unwrap();
    let mut rx = Reassembler::default();
    let start = Instant::now();

    // Packet 1 never arrives
    assert!(rx.push(&packets[0], start).unwrap().is_none());
    assert!(rx.push(&packets[2], start).unwrap().is_none());
    assert_eq!(rx.pending(), 1);

    rx.evict_stale(start + Duration::from_millis(400));
    assert_eq!(rx.pending(), 0);

    // A late fragment starts a fresh, incomplete frame
    assert!(rx.push(&packets[1], start + Duration::from_millis(401)).unwrap().is_none());
    assert_eq!(rx.stats().frames_completed, 0);
}
