//! Memory-adaptive camera frame streaming
//!
//! Captures frames from a constrained image sensor and pushes them to
//! remote consumers, sizing its buffering to the memory probed at boot:
//! - [`tier`] picks resolution, buffer count and grab policy once
//! - [`capture`] owns the frame buffer pool and the camera driver
//! - [`http`] serves an MJPEG `multipart/x-mixed-replace` stream
//! - [`transport`] pushes frames over UDP fragments or TCP length+ACK
//!
//! # Example
//!
//! ```no_run
//! use camstream::tier::{select_tier, TierPolicy};
//! use camstream::transport::fragment;
//!
//! let tier = select_tier(4 * 1024 * 1024, &TierPolicy::default());
//! println!("{} x{}", tier.resolution, tier.buffer_count);
//!
//! // let packets = fragment(frame_id, jpeg.data(), 1024)?;
//! ```

pub mod capture;
pub mod config;
pub mod connectivity;
pub mod encoder;
pub mod http;
pub mod report;
pub mod tier;
pub mod transport;

// Re-exports for convenience
pub use capture::{CaptureBufferPool, CaptureError, FrameHandle, FrameRef, FrameSource};
pub use config::Config;
pub use encoder::{EncodeError, StreamEncoder};
pub use tier::{select_tier, Tier, TierPolicy};
