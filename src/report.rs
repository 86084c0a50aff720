//! Detection result reporting
//!
//! A periodic task runs the configured [`Detector`] over a fresh frame and
//! posts any hits as JSON through a [`Reporter`]. Reporting is best effort:
//! every failure is logged and the next cycle carries on.

use crate::capture::{CaptureError, FrameRef, FrameSource, PoolError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to post report: {0}")]
    Post(String),
}

/// Detected object, in frame pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// One detection pass over one frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionReport {
    pub timestamp_ms: u64,
    pub frame_width: u32,
    pub frame_height: u32,
    pub detections: Vec<BoundingBox>,
}

impl DetectionReport {
    pub fn new(frame: &FrameRef, detections: Vec<BoundingBox>) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Self {
            timestamp_ms,
            frame_width: frame.width(),
            frame_height: frame.height(),
            detections,
        }
    }

    /// Serializes into a buffer owned by the caller
    pub fn to_json(&self) -> Result<String, ReportError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Object detector run on captured frames
pub trait Detector: Send + 'static {
    fn detect(&mut self, frame: &FrameRef) -> Vec<BoundingBox>;
}

/// Detector that never finds anything
pub struct NullDetector;

impl Detector for NullDetector {
    fn detect(&mut self, _frame: &FrameRef) -> Vec<BoundingBox> {
        Vec::new()
    }
}

/// Sink for serialized reports
pub trait Reporter: Send + Sync + 'static {
    fn post_json(&self, payload: String) -> impl Future<Output = Result<(), ReportError>> + Send;
}

/// Writes reports to the log under the configured endpoint name
pub struct LogReporter {
    url: String,
}

impl LogReporter {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Reporter for LogReporter {
    async fn post_json(&self, payload: String) -> Result<(), ReportError> {
        info!(url = %self.url, payload = %payload, "Detection report");
        Ok(())
    }
}

/// Runs one capture/detect/post cycle
///
/// The frame is released before the report is posted. Returns whether a
/// report was sent.
pub async fn report_once<D: Detector, R: Reporter>(
    source: &FrameSource,
    detector: &mut D,
    reporter: &R,
) -> Result<bool, CaptureError> {
    let frame = source.capture().await?;
    let detections = detector.detect(&frame);
    let report = DetectionReport::new(&frame, detections);
    drop(frame);

    if report.detections.is_empty() {
        return Ok(false);
    }

    let payload = match report.to_json() {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "Report serialization failed");
            return Ok(false);
        }
    };

    match reporter.post_json(payload).await {
        Ok(()) => {
            debug!(detections = report.detections.len(), "Report posted");
            Ok(true)
        }
        Err(e) => {
            warn!(error = %e, "Report post failed");
            Ok(false)
        }
    }
}

/// Periodic reporting loop; stops when the frame source shuts down
pub async fn run_reporter<D: Detector, R: Reporter>(
    source: Arc<FrameSource>,
    mut detector: D,
    reporter: R,
    interval: Duration,
) {
    info!(interval = ?interval, "Detection reporter started");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        match report_once(&source, &mut detector, &reporter).await {
            Ok(_) => {}
            Err(CaptureError::Pool(PoolError::Closed)) => break,
            Err(e) => warn!(error = %e, "Camera capture failed"),
        }
    }

    info!("Detection reporter stopped");
}
