//! Frame capture: buffer pool, camera drivers and the frame source
//!
//! The [`FrameSource`] wraps one camera driver and one [`CaptureBufferPool`]
//! sized by the boot-time [`Tier`]. Each `capture()` call performs a single
//! driver grab (or, in continuous mode, takes the newest frame the grabber
//! task produced) and never retries; the calling loop owns retry policy.

#[cfg(feature = "gstreamer")]
mod gst;
mod pattern;
pub mod pool;

#[cfg(feature = "gstreamer")]
pub use gst::GstDriver;
pub use pattern::TestPatternDriver;
pub use pool::{
    CaptureBufferPool, FrameHandle, FrameInfo, FrameRef, PoolError, PoolStats, SlotGuard,
};

use crate::config::{CameraConfig, DriverKind};
use crate::tier::{GrabPolicy, Tier};
use bytes::buf::Limit;
use bytes::{BufMut, BytesMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("no frame available")]
    NoFrame,

    #[error("timed out waiting for frame")]
    Timeout,

    #[error("frame of {len} bytes does not fit in {room} bytes")]
    Overflow { len: usize, room: usize },

    #[error("backend error: {0}")]
    Backend(String),
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("capture failed: {0}")]
    CaptureFailed(#[from] DriverError),

    #[error("camera init failed: {0}")]
    CameraInitFailed(String),

    #[error("frame of {len} bytes exceeds {budget} byte buffer")]
    FrameTooLarge { len: usize, budget: usize },

    #[error("buffer pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("capture task failed: {0}")]
    Task(String),
}

impl CaptureError {
    /// Whether the calling loop should retry after a short delay
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CaptureError::CaptureFailed(_)
                | CaptureError::FrameTooLarge { .. }
                | CaptureError::Task(_)
        )
    }
}

/// How long a continuous-mode `capture()` waits for the grabber
pub const DEFAULT_GRAB_TIMEOUT: Duration = Duration::from_secs(1);

/// A pool slot capped at the tier's frame budget
pub type FrameBuf<'a> = Limit<&'a mut BytesMut>;

/// Checks that `len` more bytes fit before a driver copies them in
pub fn ensure_room(buf: &FrameBuf<'_>, len: usize) -> Result<(), DriverError> {
    let room = buf.remaining_mut();
    if len > room {
        return Err(DriverError::Overflow { len, room });
    }
    Ok(())
}

/// Camera peripheral driver
///
/// `grab` blocks until one frame has been written into `buf` and returns its
/// geometry. It runs on the blocking thread pool. Writes past the frame
/// budget are rejected, so drivers call [`ensure_room`] before copying.
pub trait CameraDriver: Send + 'static {
    fn grab(&mut self, buf: &mut FrameBuf<'_>) -> Result<FrameInfo, DriverError>;

    fn name(&self) -> &str;
}

/// Opens the configured driver for `tier`
pub fn open_driver(
    config: &CameraConfig,
    tier: &Tier,
) -> Result<Box<dyn CameraDriver>, CaptureError> {
    match config.driver {
        DriverKind::TestPattern => Ok(Box::new(TestPatternDriver::new(
            tier.resolution.width(),
            tier.resolution.height(),
            tier.pixel_format,
            config.fps,
            config.fail_every,
        ))),
        #[cfg(feature = "gstreamer")]
        DriverKind::Gstreamer => Ok(Box::new(GstDriver::open(config, tier)?)),
        #[cfg(not(feature = "gstreamer"))]
        DriverKind::Gstreamer => Err(CaptureError::CameraInitFailed(
            "built without the gstreamer feature".to_string(),
        )),
    }
}

/// Statistics for capture
#[derive(Debug, Clone, Default)]
pub struct CaptureStats {
    pub frames_captured: u64,
    pub capture_failures: u64,
    pub frames_recycled: u64,
    pub is_continuous: bool,
}

/// Produces pool-backed frames from a camera driver
pub struct FrameSource {
    tier: Tier,
    pool: CaptureBufferPool,
    driver: Arc<Mutex<Box<dyn CameraDriver>>>,
    driver_name: String,

    // Continuous (grabber) mode
    continuous: AtomicBool,
    grab_timeout: Duration,

    // Statistics
    frames_captured: AtomicU64,
    capture_failures: AtomicU64,
}

impl FrameSource {
    /// Creates a source with a fresh pool sized for `tier`
    pub fn new(tier: Tier, driver: Box<dyn CameraDriver>) -> Self {
        let driver_name = driver.name().to_string();

        info!(
            driver = %driver_name,
            resolution = %tier.resolution,
            buffers = tier.buffer_count,
            location = ?tier.location,
            grab_policy = ?tier.grab_policy,
            budget = tier.frame_budget(),
            "Frame source created"
        );

        Self {
            tier,
            pool: CaptureBufferPool::new(tier),
            driver: Arc::new(Mutex::new(driver)),
            driver_name,
            continuous: AtomicBool::new(false),
            grab_timeout: DEFAULT_GRAB_TIMEOUT,
            frames_captured: AtomicU64::new(0),
            capture_failures: AtomicU64::new(0),
        }
    }

    /// Opens the configured driver; failure here is fatal at boot
    pub fn open(tier: Tier, config: &CameraConfig) -> Result<Self, CaptureError> {
        let driver = open_driver(config, &tier)?;
        Ok(Self::new(tier, driver).with_grab_timeout(config.grab_timeout()))
    }

    /// Bounds how long continuous-mode `capture()` waits for a fresh frame
    pub fn with_grab_timeout(mut self, timeout: Duration) -> Self {
        self.grab_timeout = timeout;
        self
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn pool(&self) -> &CaptureBufferPool {
        &self.pool
    }

    /// Captures one frame
    ///
    /// With the grabber running this returns the most recent completed frame,
    /// failing with [`DriverError::Timeout`] when none arrives within the grab
    /// timeout; otherwise it reserves a buffer per the tier's grab policy and
    /// performs one driver grab into it.
    pub async fn capture(&self) -> Result<FrameRef, CaptureError> {
        if self.continuous.load(Ordering::Relaxed) {
            return match tokio::time::timeout(self.grab_timeout, self.pool.latest()).await {
                Ok(frame) => Ok(frame?),
                Err(_) => Err(CaptureError::CaptureFailed(DriverError::Timeout)),
            };
        }

        let guard = self.pool.reserve().await?;
        let (guard, info) = self.fill(guard).await?;
        Ok(guard.into_frame(info))
    }

    /// Starts continuous capture for [`GrabPolicy::PreferLatest`] tiers
    ///
    /// The grabber keeps the pool filled, recycling the oldest undelivered
    /// frame, so a slow consumer never stalls capture. Returns `None` for
    /// back-pressure tiers, which capture on demand.
    pub fn spawn_grabber(self: &Arc<Self>, retry_delay: Duration) -> Option<JoinHandle<()>> {
        if self.tier.grab_policy != GrabPolicy::PreferLatest {
            return None;
        }

        self.continuous.store(true, Ordering::Relaxed);
        let source = Arc::clone(self);

        Some(tokio::spawn(async move {
            info!(driver = %source.driver_name, "Continuous capture started");

            loop {
                let guard = match source.pool.reserve().await {
                    Ok(guard) => guard,
                    Err(PoolError::Closed) => break,
                    Err(e) => {
                        warn!(error = %e, "Grabber could not reserve buffer");
                        continue;
                    }
                };

                match source.fill(guard).await {
                    Ok((guard, info)) => guard.commit(info),
                    Err(e) => {
                        warn!(error = %e, "Camera capture failed");
                        tokio::time::sleep(retry_delay).await;
                    }
                }
            }

            source.continuous.store(false, Ordering::Relaxed);
            info!("Continuous capture stopped");
        }))
    }

    /// Runs one driver grab into `guard` on the blocking pool
    async fn fill(&self, mut guard: SlotGuard) -> Result<(SlotGuard, FrameInfo), CaptureError> {
        let driver = Arc::clone(&self.driver);

        let (guard, result) = tokio::task::spawn_blocking(move || {
            let result = {
                let mut driver = driver.lock().unwrap_or_else(|e| e.into_inner());
                let budget = guard.budget();
                let mut buf = guard.buffer_mut().limit(budget);
                driver.grab(&mut buf)
            };
            (guard, result)
        })
        .await
        .map_err(|e| {
            self.capture_failures.fetch_add(1, Ordering::Relaxed);
            CaptureError::Task(e.to_string())
        })?;

        let mut guard = guard;
        let info = match result {
            Ok(info) => info,
            Err(e) => {
                self.capture_failures.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };

        let len = guard.buffer_mut().len();
        if len > guard.budget() {
            self.capture_failures.fetch_add(1, Ordering::Relaxed);
            return Err(CaptureError::FrameTooLarge {
                len,
                budget: guard.budget(),
            });
        }

        self.frames_captured.fetch_add(1, Ordering::Relaxed);
        debug!(handle = %guard.handle(), len, "Frame captured");
        Ok((guard, info))
    }

    pub fn get_stats(&self) -> CaptureStats {
        CaptureStats {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            capture_failures: self.capture_failures.load(Ordering::Relaxed),
            frames_recycled: self.pool.stats().recycled,
            is_continuous: self.continuous.load(Ordering::Relaxed),
        }
    }

    /// Stops the grabber and wakes every waiter with a closed-pool error
    pub fn stop(&self) {
        self.pool.close();
    }
}
