//! Receiver-side frame reassembly for the UDP protocol
//!
//! Fragments are collected per frame id. A frame is complete once every
//! index has arrived; duplicates are ignored. Frames that go quiet for longer
//! than the stale timeout are dropped, and completed frames that do not
//! start with SOI and end with EOI are rejected.

use super::packet::{decode_datagram, PacketError, MAX_CHUNK};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Default time a partial frame may wait for its next fragment
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_millis(300);

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("malformed datagram: {0}")]
    Malformed(#[from] PacketError),

    #[error("frame {frame_id} announced {expected} packets, fragment says {got}")]
    TotalMismatch { frame_id: u16, expected: u16, got: u16 },

    #[error("frame {0} is missing JPEG markers")]
    BadMarkers(u16),
}

/// Receiver counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReassemblyStats {
    pub frames_completed: u64,
    pub frames_stale: u64,
    pub frames_rejected: u64,
    pub datagrams_dropped: u64,
    pub duplicates: u64,
}

struct Partial {
    total: u16,
    received: u16,
    chunks: Vec<Option<Bytes>>,
    last_seen: Instant,
}

pub struct Reassembler {
    max_chunk: usize,
    stale_after: Duration,
    frames: HashMap<u16, Partial>,
    stats: ReassemblyStats,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(MAX_CHUNK, DEFAULT_STALE_AFTER)
    }
}

impl Reassembler {
    pub fn new(max_chunk: usize, stale_after: Duration) -> Self {
        Self {
            max_chunk,
            stale_after,
            frames: HashMap::new(),
            stats: ReassemblyStats::default(),
        }
    }

    /// Feeds one datagram, returning the frame it completes
    pub fn push(
        &mut self,
        datagram: &[u8],
        now: Instant,
    ) -> Result<Option<Bytes>, ReassemblyError> {
        let (header, payload) = decode_datagram(datagram, self.max_chunk).inspect_err(|_| {
            self.stats.datagrams_dropped += 1;
        })?;
        let frame_id = header.frame_id;

        let partial = self.frames.entry(frame_id).or_insert_with(|| Partial {
            total: header.total_packets,
            received: 0,
            chunks: vec![None; header.total_packets as usize],
            last_seen: now,
        });

        if partial.total != header.total_packets {
            self.stats.datagrams_dropped += 1;
            return Err(ReassemblyError::TotalMismatch {
                frame_id,
                expected: partial.total,
                got: header.total_packets,
            });
        }

        let slot = &mut partial.chunks[header.packet_index as usize];
        if slot.is_some() {
            self.stats.duplicates += 1;
            return Ok(None);
        }
        *slot = Some(Bytes::copy_from_slice(payload));
        partial.received += 1;
        partial.last_seen = now;

        if partial.received < partial.total {
            return Ok(None);
        }

        let Some(partial) = self.frames.remove(&frame_id) else {
            return Ok(None);
        };
        let len = partial.chunks.iter().flatten().map(Bytes::len).sum();
        let mut frame = BytesMut::with_capacity(len);
        for chunk in partial.chunks.iter().flatten() {
            frame.extend_from_slice(chunk);
        }

        if !(frame.starts_with(&SOI) && frame.ends_with(&EOI)) {
            self.stats.frames_rejected += 1;
            return Err(ReassemblyError::BadMarkers(frame_id));
        }

        self.stats.frames_completed += 1;
        Ok(Some(frame.freeze()))
    }

    /// Drops partial frames idle for longer than the stale timeout
    ///
    /// Returns the number of frames evicted.
    pub fn evict_stale(&mut self, now: Instant) -> usize {
        let before = self.frames.len();
        let stale_after = self.stale_after;

        self.frames.retain(|frame_id, partial| {
            let keep = now.saturating_duration_since(partial.last_seen) <= stale_after;
            if !keep {
                debug!(
                    frame_id,
                    received = partial.received,
                    total = partial.total,
                    "Frame timed out"
                );
            }
            keep
        });

        let evicted = before - self.frames.len();
        self.stats.frames_stale += evicted as u64;
        evicted
    }

    /// Number of frames still waiting for fragments
    pub fn pending(&self) -> usize {
        self.frames.len()
    }

    pub fn stats(&self) -> &ReassemblyStats {
        &self.stats
    }
}
