//! JPEG normalisation of captured frames
//!
//! Publishers only ever emit JPEG. Frames the sensor already compressed pass
//! through untouched; raw frames are converted with the `image` crate and
//! their pool buffer is handed back as soon as the JPEG exists.

use crate::capture::{FrameInfo, FrameRef};
use crate::tier::PixelFormat;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("JPEG encoding failed: {0}")]
    EncodeFailed(String),

    #[error("{format:?} frame is {actual} bytes, expected {expected}")]
    UnexpectedLength {
        format: PixelFormat,
        expected: usize,
        actual: usize,
    },
}

/// Statistics for the encoder
#[derive(Debug, Clone, Default)]
pub struct EncoderStats {
    pub passthrough: u64,
    pub transcoded: u64,
    pub failures: u64,
}

#[derive(Default)]
struct Counters {
    passthrough: AtomicU64,
    transcoded: AtomicU64,
    failures: AtomicU64,
}

/// Converts frames to JPEG on demand
#[derive(Clone)]
pub struct StreamEncoder {
    quality: u8,
    counters: Arc<Counters>,
}

impl StreamEncoder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
            counters: Arc::default(),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Returns a JPEG frame for `frame`
    ///
    /// JPEG input comes back as-is, still backed by its pool buffer. Any
    /// other format is transcoded into an owned buffer and the input is
    /// released, whether or not the conversion succeeded.
    pub fn ensure_jpeg(&self, frame: FrameRef) -> Result<FrameRef, EncodeError> {
        if frame.format() == PixelFormat::Jpeg {
            self.counters.passthrough.fetch_add(1, Ordering::Relaxed);
            return Ok(frame);
        }

        let result = self.transcode(&frame);
        if let Err(e) = frame.release() {
            error!(error = %e, "Failed to release transcoded frame");
        }

        match result {
            Ok(frame) => {
                self.counters.transcoded.fetch_add(1, Ordering::Relaxed);
                Ok(frame)
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// [`ensure_jpeg`](Self::ensure_jpeg) with transcoding moved to the
    /// blocking pool
    pub async fn encode(&self, frame: FrameRef) -> Result<FrameRef, EncodeError> {
        if frame.format() == PixelFormat::Jpeg {
            return self.ensure_jpeg(frame);
        }

        let encoder = self.clone();
        tokio::task::spawn_blocking(move || encoder.ensure_jpeg(frame))
            .await
            .map_err(|e| EncodeError::EncodeFailed(e.to_string()))?
    }

    fn transcode(&self, frame: &FrameRef) -> Result<FrameRef, EncodeError> {
        let info = frame.info();
        let (width, height) = (info.width, info.height);

        let expected = info.format.raw_len(width, height).unwrap_or(0);
        if frame.len() != expected {
            return Err(EncodeError::UnexpectedLength {
                format: info.format,
                expected,
                actual: frame.len(),
            });
        }

        let data = frame.data();
        let converted;
        let (pixels, color) = match info.format {
            PixelFormat::Grayscale => (data, ExtendedColorType::L8),
            PixelFormat::Rgb888 => (data, ExtendedColorType::Rgb8),
            PixelFormat::Rgb565 => {
                converted = rgb565_to_rgb(data);
                (converted.as_slice(), ExtendedColorType::Rgb8)
            }
            PixelFormat::Yuv422 => {
                converted = yuyv_to_rgb(data);
                (converted.as_slice(), ExtendedColorType::Rgb8)
            }
            PixelFormat::Jpeg => unreachable!("jpeg frames are passed through"),
        };

        // Typical compression keeps output well under a fifth of raw size
        let mut out = Vec::with_capacity(expected / 5);
        JpegEncoder::new_with_quality(&mut out, self.quality)
            .encode(pixels, width, height, color)
            .map_err(|e| EncodeError::EncodeFailed(e.to_string()))?;

        debug!(
            format = ?info.format,
            raw = expected,
            jpeg = out.len(),
            "Frame transcoded"
        );

        Ok(FrameRef::from_bytes(
            Bytes::from(out),
            FrameInfo {
                format: PixelFormat::Jpeg,
                ..info
            },
        ))
    }

    pub fn get_stats(&self) -> EncoderStats {
        EncoderStats {
            passthrough: self.counters.passthrough.load(Ordering::Relaxed),
            transcoded: self.counters.transcoded.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }
}

/// Big-endian RGB565, as the sensor emits it
fn rgb565_to_rgb(data: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(data.len() / 2 * 3);
    for px in data.chunks_exact(2) {
        let v = u16::from_be_bytes([px[0], px[1]]);
        let r = ((v >> 11) & 0x1F) as u8;
        let g = ((v >> 5) & 0x3F) as u8;
        let b = (v & 0x1F) as u8;
        rgb.push((r << 3) | (r >> 2));
        rgb.push((g << 2) | (g >> 4));
        rgb.push((b << 3) | (b >> 2));
    }
    rgb
}

/// Packed YUYV 4:2:2 to RGB (BT.601, full range)
fn yuyv_to_rgb(data: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(data.len() / 2 * 3);
    for quad in data.chunks_exact(4) {
        let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
        push_yuv(&mut rgb, y0, u, v);
        push_yuv(&mut rgb, y1, u, v);
    }
    rgb
}

fn push_yuv(rgb: &mut Vec<u8>, y: u8, u: u8, v: u8) {
    let y = y as f32;
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;

    rgb.push((y + 1.402 * v).clamp(0.0, 255.0) as u8);
    rgb.push((y - 0.344_136 * u - 0.714_136 * v).clamp(0.0, 255.0) as u8);
    rgb.push((y + 1.772 * u).clamp(0.0, 255.0) as u8);
}
