//! UDP fragment transport
//!
//! Each frame is split into `ceil(len / max_chunk)` datagrams, each carrying
//! a [`PacketHeader`] and up to `max_chunk` payload bytes. Delivery is best
//! effort: lost datagrams are never resent, and the frame id advances once
//! per transmitted frame whether or not its datagrams arrive.

use super::packet::{PacketHeader, HEADER_SIZE};
use super::stats::TransportCounters;
use super::{resolve, TransportError};
use crate::capture::FrameRef;
use crate::config::TransportConfig;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, error, info};

/// Splits `data` into ready-to-send datagrams
///
/// Returns an empty vector for empty input. Fails when the frame would
/// need more packets than the 16-bit header can count.
pub fn fragment(
    frame_id: u16,
    data: &[u8],
    max_chunk: usize,
) -> Result<Vec<Bytes>, TransportError> {
    let max_chunk = max_chunk.max(1);
    let total = data.len().div_ceil(max_chunk);
    let total_packets = u16::try_from(total).map_err(|_| TransportError::TooManyPackets {
        len: data.len(),
        max_chunk,
    })?;

    // One allocation for the whole frame, split per datagram
    let mut buf = BytesMut::with_capacity(data.len() + total * HEADER_SIZE);
    let mut packets = Vec::with_capacity(total);

    for (index, chunk) in data.chunks(max_chunk).enumerate() {
        PacketHeader {
            frame_id,
            packet_index: index as u16,
            total_packets,
            payload_len: chunk.len() as u16,
        }
        .write_to(&mut buf);
        buf.extend_from_slice(chunk);
        packets.push(buf.split().freeze());
    }

    Ok(packets)
}

/// Outcome of one UDP frame transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpDelivery {
    pub frame_id: u16,
    pub packets: u16,
    pub failed: u16,
}

/// Sends frames as header-prefixed UDP fragments to one destination
pub struct UdpTransport {
    socket: UdpSocket,
    dest: SocketAddr,
    max_chunk: usize,
    next_frame_id: u16,
    counters: Arc<TransportCounters>,
}

impl UdpTransport {
    /// Binds the local socket and resolves the destination
    pub async fn bind(
        config: &TransportConfig,
        counters: Arc<TransportCounters>,
    ) -> Result<Self, TransportError> {
        let dest = resolve(&config.destination()).await?;
        let local = if dest.is_ipv6() {
            format!("[::]:{}", config.local_port)
        } else {
            format!("0.0.0.0:{}", config.local_port)
        };

        let socket = UdpSocket::bind(&local).await?;

        info!(
            local = %socket.local_addr()?,
            dest = %dest,
            max_chunk = config.max_chunk,
            "UDP transport ready"
        );

        Ok(Self {
            socket,
            dest,
            max_chunk: config.max_chunk,
            next_frame_id: 0,
            counters,
        })
    }

    pub fn destination(&self) -> SocketAddr {
        self.dest
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    /// Fragments and sends one frame
    ///
    /// The frame's buffer is released as soon as the datagrams are built.
    /// Empty and oversized frames are rejected without consuming a frame id.
    pub async fn send_frame_udp(&mut self, frame: FrameRef) -> Result<UdpDelivery, TransportError> {
        if frame.is_empty() {
            return Err(TransportError::EmptyFrame);
        }

        let frame_id = self.next_frame_id;
        let packets = fragment(frame_id, frame.data(), self.max_chunk)?;
        let len = frame.len();
        drop(frame);

        self.next_frame_id = self.next_frame_id.wrapping_add(1);

        let mut failed = 0u16;
        for (i, packet) in packets.iter().enumerate() {
            if let Err(e) = self.socket.send_to(packet, self.dest).await {
                error!(
                    error = %e,
                    frame_id,
                    packet = i,
                    total = packets.len(),
                    "Failed to send datagram"
                );
                failed += 1;
            }
        }

        let sent = packets.len() as u64 - failed as u64;
        TransportCounters::add(&self.counters.packets_sent, sent);
        if failed > 0 {
            TransportCounters::add(&self.counters.send_errors, 1);
        } else {
            TransportCounters::add(&self.counters.frames_sent, 1);
            TransportCounters::add(&self.counters.bytes_sent, len as u64);
        }

        debug!(frame_id, len, packets = packets.len(), failed, "UDP frame sent");

        Ok(UdpDelivery {
            frame_id,
            packets: packets.len() as u16,
            failed,
        })
    }
}
