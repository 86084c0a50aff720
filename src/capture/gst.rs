//! GStreamer-backed camera driver for host builds
//!
//! Builds a platform-specific `source ! caps ! [flip] ! jpegenc ! appsink`
//! pipeline. The appsink queue mirrors the tier: it holds `buffer_count`
//! samples and drops the oldest one only under `PreferLatest`.

use super::{ensure_room, CameraDriver, CaptureError, DriverError, FrameBuf, FrameInfo};
use crate::config::CameraConfig;
use crate::tier::{GrabPolicy, PixelFormat, Tier};
use bytes::BufMut;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use std::path::Path;
use tracing::{debug, info, warn};

/// Host platform, which decides the source element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Platform {
    MacOS,
    RaspberryPi,
    Linux,
}

fn detect_platform() -> Platform {
    match std::env::consts::OS {
        "macos" => Platform::MacOS,
        _ if Path::new("/proc/device-tree/model").exists()
            || Path::new("/sys/firmware/devicetree/base/model").exists() =>
        {
            Platform::RaspberryPi
        }
        _ => Platform::Linux,
    }
}

pub struct GstDriver {
    pipeline: gst::Pipeline,
    app_sink: gst_app::AppSink,
    width: u32,
    height: u32,
    timeout: gst::ClockTime,
}

impl GstDriver {
    pub fn open(config: &CameraConfig, tier: &Tier) -> Result<Self, CaptureError> {
        let init = |e: String| CaptureError::CameraInitFailed(e);

        gst::init().map_err(|e| init(e.to_string()))?;

        let desc = pipeline_description(detect_platform(), config, tier);
        debug!(pipeline = %desc, "Creating GStreamer pipeline");

        let pipeline = gst::parse::launch(&desc)
            .map_err(|e| init(e.to_string()))?
            .dynamic_cast::<gst::Pipeline>()
            .map_err(|_| init("not a pipeline".to_string()))?;

        let app_sink = pipeline
            .by_name("sink")
            .ok_or_else(|| init("no appsink found".to_string()))?
            .dynamic_cast::<gst_app::AppSink>()
            .map_err(|_| init("not an appsink".to_string()))?;

        app_sink.set_property("max-buffers", tier.buffer_count as u32);
        app_sink.set_property("drop", tier.grab_policy == GrabPolicy::PreferLatest);
        app_sink.set_property("emit-signals", false);

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| init(format!("{:?}", e)))?;

        info!(
            device = %config.device,
            resolution = %tier.resolution,
            fps = config.fps,
            "GStreamer capture started"
        );

        Ok(Self {
            pipeline,
            app_sink,
            width: tier.resolution.width(),
            height: tier.resolution.height(),
            timeout: gst::ClockTime::from_mseconds(config.grab_timeout_ms),
        })
    }
}

fn pipeline_description(platform: Platform, config: &CameraConfig, tier: &Tier) -> String {
    let (w, h, fps) = (tier.resolution.width(), tier.resolution.height(), config.fps.max(1));

    let mut desc = match platform {
        Platform::MacOS => format!(
            "avfvideosrc device-index={} ! video/x-raw,width={},height={},framerate={}/1",
            config.device, w, h, fps
        ),
        Platform::RaspberryPi => format!(
            "libcamerasrc camera-name=\"{}\" ! video/x-raw,format=NV12,width={},height={},framerate={}/1",
            config.device, w, h, fps
        ),
        Platform::Linux => format!(
            "v4l2src device={} ! video/x-raw,width={},height={},framerate={}/1",
            config.device, w, h, fps
        ),
    };

    if let Some(flip) = config.flip_method.as_deref() {
        desc.push_str(flip_element(flip));
    }

    desc.push_str(&format!(
        " ! queue max-size-buffers={} leaky=downstream ! videoconvert ! jpegenc quality={} ! appsink name=sink",
        tier.buffer_count, config.jpeg_quality
    ));
    desc
}

fn flip_element(method: &str) -> &'static str {
    match method {
        "vertical-flip" => " ! videoflip video-direction=5",
        "horizontal-flip" => " ! videoflip video-direction=4",
        "rotate-180" => " ! videoflip video-direction=2",
        _ => {
            warn!(method = %method, "Unknown flip method");
            ""
        }
    }
}

impl CameraDriver for GstDriver {
    fn grab(&mut self, buf: &mut FrameBuf<'_>) -> Result<FrameInfo, DriverError> {
        let sample = self
            .app_sink
            .try_pull_sample(self.timeout)
            .ok_or(DriverError::Timeout)?;
        let buffer = sample.buffer().ok_or(DriverError::NoFrame)?;
        let map = buffer
            .map_readable()
            .map_err(|e| DriverError::Backend(e.to_string()))?;

        ensure_room(buf, map.len())?;
        buf.put_slice(map.as_slice());

        Ok(FrameInfo {
            width: self.width,
            height: self.height,
            format: PixelFormat::Jpeg,
        })
    }

    fn name(&self) -> &str {
        "gstreamer"
    }
}

impl Drop for GstDriver {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}
