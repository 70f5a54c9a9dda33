pub mod chain;
pub mod eyes;
pub mod tail;

pub use chain::DetectorChain;
pub use eyes::{EyeDetector, EyeParams};
pub use tail::{TailDetector, TailParams};

use anyhow::Result;
use image::GrayImage;

use crate::types::Timestamp;

/// Per-frame context handed to every detector alongside the image.
#[derive(Debug, Clone, Copy)]
pub struct TrackContext {
    pub t: Timestamp,
}

/// A named parameter change pushed in from the GUI / script side.
/// Applied by the dispatcher between frames, never mid-detection.
#[derive(Debug, Clone)]
pub enum ControlUpdate {
    TailStart { x: f32, y: f32 },
    TailLength { x: f32, y: f32 },
    /// Structural: changes the number of output columns.
    TailSegments(usize),
    EyeRoiPos { x: u32, y: u32 },
    EyeRoiSize { w: u32, h: u32 },
    EyeThreshold(u8),
    /// Which member's diagnostic image the display path should show.
    /// `None` goes back to raw frames. Handled by the chain itself.
    DisplayMode(Option<String>),
}

/// What applying a control update did to a detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Not a parameter of this detector.
    Ignored,
    Applied,
    /// Applied, and the output schema changed: the accumulator must be
    /// reset before the next row is appended.
    AppliedStructural,
}

/// A single image-to-feature algorithm with a fixed, declared output schema.
///
/// `detect` returns `Ok((message, values))` where `values.len()` always
/// equals the declared header count; a failed measurement fills its fields
/// with NaN sentinels and explains itself in `message`. `Err` is reserved
/// for fatal configuration errors (wrong field count for the declared
/// headers) and must never be used for per-frame tracking failures.
pub trait Detector: Send {
    fn name(&self) -> &str;

    /// Column names, in output order. Fixed for a fixed configuration.
    fn headers(&self) -> Vec<String>;

    fn field_count(&self) -> usize {
        self.headers().len()
    }

    fn detect(&mut self, image: &GrayImage, ctx: &TrackContext) -> Result<(String, Vec<f64>)>;

    /// Drop any temporal state carried between frames.
    fn reset_state(&mut self);

    /// Key identifying this detector's diagnostic image, e.g. "thresholded".
    fn diagnostic_name(&self) -> &'static str;

    /// Latest-only debug frame, overwritten on each call to `detect`.
    fn diagnostic_image(&self) -> Option<&GrayImage>;

    fn apply_update(&mut self, update: &ControlUpdate) -> UpdateOutcome;
}
