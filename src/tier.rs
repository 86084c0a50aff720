//! Boot-time resource tier selection
//!
//! The amount of extended memory (PSRAM) present on the board is probed once
//! at startup and mapped to an immutable [`Tier`]. The tier decides the
//! capture resolution, how many frame buffers the pool owns, which memory
//! region backs them and what the pool does when no buffer is free.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default extended-memory threshold for the high tier (2 MiB)
pub const DEFAULT_EXTENDED_THRESHOLD: u64 = 2 * 1024 * 1024;

/// Default capacity of the on-chip frame buffer region (96 KiB)
pub const DEFAULT_ONCHIP_CAPACITY: u64 = 96 * 1024;

/// Capture resolutions supported by the sensor, smallest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// 160x120
    Qqvga,
    /// 320x240
    Qvga,
    /// 640x480
    Vga,
    /// 800x600
    Svga,
}

impl Resolution {
    /// Resolution ladder used when stepping down to fit a region
    pub const LADDER: [Resolution; 4] = [
        Resolution::Svga,
        Resolution::Vga,
        Resolution::Qvga,
        Resolution::Qqvga,
    ];

    pub fn width(self) -> u32 {
        match self {
            Resolution::Qqvga => 160,
            Resolution::Qvga => 320,
            Resolution::Vga => 640,
            Resolution::Svga => 800,
        }
    }

    pub fn height(self) -> u32 {
        match self {
            Resolution::Qqvga => 120,
            Resolution::Qvga => 240,
            Resolution::Vga => 480,
            Resolution::Svga => 600,
        }
    }

    pub fn pixels(self) -> u64 {
        self.width() as u64 * self.height() as u64
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width(), self.height())
    }
}

/// Pixel format produced by the sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Jpeg,
    Grayscale,
    Rgb565,
    Rgb888,
    /// Packed YUYV 4:2:2
    Yuv422,
}

impl PixelFormat {
    /// Worst-case byte size of one frame of this format at `resolution`
    ///
    /// JPEG frames are budgeted at one fifth of the pixel count, the same
    /// bound the sensor driver uses for its receive buffers.
    pub fn frame_budget(self, resolution: Resolution) -> u64 {
        let px = resolution.pixels();
        match self {
            PixelFormat::Jpeg => px / 5,
            PixelFormat::Grayscale => px,
            PixelFormat::Rgb565 | PixelFormat::Yuv422 => px * 2,
            PixelFormat::Rgb888 => px * 3,
        }
    }

    /// Exact byte length of an uncompressed frame, `None` for JPEG
    pub fn raw_len(self, width: u32, height: u32) -> Option<usize> {
        let px = width as usize * height as usize;
        match self {
            PixelFormat::Jpeg => None,
            PixelFormat::Grayscale => Some(px),
            PixelFormat::Rgb565 | PixelFormat::Yuv422 => Some(px * 2),
            PixelFormat::Rgb888 => Some(px * 3),
        }
    }
}

/// Memory region backing the frame buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryLocation {
    OnChip,
    Extended,
}

/// What the pool does when a frame is requested and no buffer is free
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GrabPolicy {
    /// Block the caller until a buffer is released (back-pressure)
    WaitForFree,
    /// Recycle the oldest undelivered buffer; slow consumers lose stale frames
    PreferLatest,
}

/// Inputs to tier selection that are not probed from hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierPolicy {
    /// Minimum detected extended memory for the high tier
    pub extended_threshold: u64,
    /// Bytes of on-chip memory available to frame buffers
    pub onchip_capacity: u64,
    /// Sensor output format
    pub pixel_format: PixelFormat,
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self {
            extended_threshold: DEFAULT_EXTENDED_THRESHOLD,
            onchip_capacity: DEFAULT_ONCHIP_CAPACITY,
            pixel_format: PixelFormat::Jpeg,
        }
    }
}

/// Immutable capture configuration chosen once at boot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tier {
    pub resolution: Resolution,
    pub buffer_count: usize,
    pub location: MemoryLocation,
    pub grab_policy: GrabPolicy,
    pub pixel_format: PixelFormat,
}

impl Tier {
    /// Byte budget of a single frame buffer
    pub fn frame_budget(&self) -> u64 {
        self.pixel_format.frame_budget(self.resolution)
    }

    /// Total bytes the pool reserves in the tier's region
    pub fn pool_bytes(&self) -> u64 {
        self.frame_budget() * self.buffer_count as u64
    }

    /// Capacity of the tier's region for the given probe result
    pub fn region_capacity(&self, detected_extended: u64, policy: &TierPolicy) -> u64 {
        match self.location {
            MemoryLocation::OnChip => policy.onchip_capacity,
            MemoryLocation::Extended => detected_extended,
        }
    }
}

/// Picks the capture tier for the probed amount of extended memory
///
/// Pure and deterministic. The high tier is double-buffered in extended
/// memory and prefers the latest frame; the low tier is a single on-chip
/// buffer with back-pressure. The preferred resolution of each tier steps
/// down until `buffer_count * frame_budget` fits the region.
pub fn select_tier(detected_extended: u64, policy: &TierPolicy) -> Tier {
    if detected_extended >= policy.extended_threshold {
        if let Some(resolution) = fit_resolution(
            Resolution::Svga,
            2,
            policy.pixel_format,
            detected_extended,
        ) {
            return Tier {
                resolution,
                buffer_count: 2,
                location: MemoryLocation::Extended,
                grab_policy: GrabPolicy::PreferLatest,
                pixel_format: policy.pixel_format,
            };
        }
    }

    // QQVGA at the widest format is 57600 bytes; capacities below that are
    // rejected by config validation.
    let resolution = fit_resolution(
        Resolution::Qvga,
        1,
        policy.pixel_format,
        policy.onchip_capacity,
    )
    .unwrap_or(Resolution::Qqvga);

    Tier {
        resolution,
        buffer_count: 1,
        location: MemoryLocation::OnChip,
        grab_policy: GrabPolicy::WaitForFree,
        pixel_format: policy.pixel_format,
    }
}

fn fit_resolution(
    preferred: Resolution,
    buffer_count: u64,
    format: PixelFormat,
    capacity: u64,
) -> Option<Resolution> {
    Resolution::LADDER
        .iter()
        .copied()
        .filter(|r| *r <= preferred)
        .find(|r| format.frame_budget(*r) * buffer_count <= capacity)
}
