//! Synthetic camera driver
//!
//! Renders a moving gradient in any supported pixel format. Used for bench
//! setups without a sensor and by the test suite, which can make every Nth
//! grab fail to exercise the capture retry paths.

use super::{ensure_room, CameraDriver, DriverError, FrameBuf, FrameInfo};
use crate::tier::PixelFormat;
use bytes::BufMut;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use std::time::{Duration, Instant};

const PATTERN_JPEG_QUALITY: u8 = 80;

pub struct TestPatternDriver {
    width: u32,
    height: u32,
    format: PixelFormat,
    frame_interval: Option<Duration>,
    fail_every: Option<u32>,
    next_deadline: Option<Instant>,
    grabs: u64,
}

impl TestPatternDriver {
    /// `fps == 0` grabs as fast as the caller asks; `fail_every == Some(n)`
    /// makes every nth grab return [`DriverError::NoFrame`].
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        fps: u32,
        fail_every: Option<u32>,
    ) -> Self {
        Self {
            width,
            height,
            format,
            frame_interval: (fps > 0).then(|| Duration::from_secs(1) / fps),
            fail_every: fail_every.filter(|n| *n > 0),
            next_deadline: None,
            grabs: 0,
        }
    }

    fn pace(&mut self) {
        let Some(interval) = self.frame_interval else {
            return;
        };

        let now = Instant::now();
        let deadline = self.next_deadline.unwrap_or(now);
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
        self.next_deadline = Some(deadline.max(now) + interval);
    }

    fn rgb(&self, phase: u32) -> Vec<u8> {
        let mut rgb = Vec::with_capacity((self.width * self.height * 3) as usize);
        for y in 0..self.height {
            for x in 0..self.width {
                rgb.push(((x + phase) * 255 / self.width.max(1)) as u8);
                rgb.push((y * 255 / self.height.max(1)) as u8);
                rgb.push((phase * 4) as u8);
            }
        }
        rgb
    }

    fn render(&self, buf: &mut FrameBuf<'_>, phase: u32) -> Result<(), DriverError> {
        if let Some(len) = self.format.raw_len(self.width, self.height) {
            ensure_room(buf, len)?;
        }

        match self.format {
            PixelFormat::Jpeg => {
                let rgb = self.rgb(phase);
                let mut jpeg = Vec::new();
                JpegEncoder::new_with_quality(&mut jpeg, PATTERN_JPEG_QUALITY)
                    .encode(&rgb, self.width, self.height, ExtendedColorType::Rgb8)
                    .map_err(|e| DriverError::Backend(e.to_string()))?;

                ensure_room(buf, jpeg.len())?;
                buf.put_slice(&jpeg);
            }
            PixelFormat::Rgb888 => buf.put_slice(&self.rgb(phase)),
            PixelFormat::Rgb565 => {
                for px in self.rgb(phase).chunks_exact(3) {
                    let (r, g, b) = (px[0] as u16, px[1] as u16, px[2] as u16);
                    buf.put_u16(((r >> 3) << 11) | ((g >> 2) << 5) | (b >> 3));
                }
            }
            PixelFormat::Grayscale => {
                for px in self.rgb(phase).chunks_exact(3) {
                    buf.put_u8(((px[0] as u16 + px[1] as u16 + px[2] as u16) / 3) as u8);
                }
            }
            PixelFormat::Yuv422 => {
                for y in 0..self.height {
                    for x in (0..self.width).step_by(2) {
                        let luma = ((x + phase) * 255 / self.width.max(1)) as u8;
                        let chroma = (y * 255 / self.height.max(1)) as u8;
                        buf.put_slice(&[luma, chroma, luma, 128]);
                    }
                }
            }
        }
        Ok(())
    }
}

impl CameraDriver for TestPatternDriver {
    fn grab(&mut self, buf: &mut FrameBuf<'_>) -> Result<FrameInfo, DriverError> {
        self.pace();
        self.grabs += 1;

        if let Some(n) = self.fail_every {
            if self.grabs % n as u64 == 0 {
                return Err(DriverError::NoFrame);
            }
        }

        let phase = (self.grabs % 64) as u32;
        self.render(buf, phase)?;

        Ok(FrameInfo {
            width: self.width,
            height: self.height,
            format: self.format,
        })
    }

    fn name(&self) -> &str {
        "test-pattern"
    }
}
