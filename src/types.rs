use std::sync::Arc;

use image::GrayImage;

/// Seconds since the pipeline started, monotonic. The frame source stamps
/// frames and the accumulator indexes rows in the same clock domain.
pub type Timestamp = f64;

/// Placeholder for a field an algorithm failed to measure this frame.
/// Downstream consumers can tell a failed fit from a real zero.
pub const SENTINEL: f64 = f64::NAN;

/// One timestamped camera frame. The pixel buffer is shared read-only:
/// the dispatcher hands clones of the same `Arc` to the display path and
/// the detectors, nobody mutates it after capture.
#[derive(Debug, Clone)]
pub struct Frame {
    pub t: Timestamp,
    pub image: Arc<GrayImage>,
}

impl Frame {
    pub fn new(t: Timestamp, image: GrayImage) -> Self {
        Self {
            t,
            image: Arc::new(image),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// A vector of sentinels matching a declared field count.
pub fn sentinel_row(n: usize) -> Vec<f64> {
    vec![SENTINEL; n]
}
