//! Transport statistics

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of transport counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportStats {
    /// Frames fully handed to the network
    pub frames_sent: u64,

    /// Frames that could not be captured or encoded
    pub frames_dropped: u64,

    /// Frames with at least one failed datagram
    pub send_errors: u64,

    /// TCP deliveries aborted before or during the payload
    pub tcp_aborts: u64,

    /// Total UDP datagrams sent
    pub packets_sent: u64,

    /// Total frame bytes sent
    pub bytes_sent: u64,
}

impl TransportStats {
    /// Calculates frame rate based on delta
    pub fn calculate_fps(&self, previous: &Self, elapsed_secs: f64) -> f64 {
        if elapsed_secs == 0.0 {
            return 0.0;
        }

        let frames_delta = self.frames_sent.saturating_sub(previous.frames_sent);
        frames_delta as f64 / elapsed_secs
    }

    /// Calculates bitrate in kbps based on delta
    pub fn calculate_bitrate_kbps(&self, previous: &Self, elapsed_secs: f64) -> f64 {
        if elapsed_secs == 0.0 {
            return 0.0;
        }

        let bytes_delta = self.bytes_sent.saturating_sub(previous.bytes_sent);
        (bytes_delta as f64 * 8.0) / elapsed_secs / 1000.0
    }

    /// Share of attempted frames that never made it out
    pub fn failure_rate(&self) -> f64 {
        let failed = self.frames_dropped + self.send_errors + self.tcp_aborts;
        let total = self.frames_sent + failed;
        if total == 0 {
            return 0.0;
        }

        failed as f64 / total as f64
    }
}

/// Lock-free counters shared by the transport and its task
#[derive(Debug, Default)]
pub struct TransportCounters {
    pub frames_sent: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub send_errors: AtomicU64,
    pub tcp_aborts: AtomicU64,
    pub packets_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
}

impl TransportCounters {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransportStats {
        TransportStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            tcp_aborts: self.tcp_aborts.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}
