use std::f32::consts::{FRAC_PI_2, PI};

use anyhow::Result;
use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::types::sentinel_row;

use super::{ControlUpdate, Detector, TrackContext, UpdateOutcome};

/// Parameters for the tail centroid tracker. `start` and `length` come from
/// the GUI's tail ROI (a line segment from tail base toward the tip).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TailParams {
    pub start: (f32, f32),
    pub length: (f32, f32),
    pub n_segments: usize,
    /// Half-size in pixels of the square sampling window around each probe.
    pub window: u32,
    /// Pixels at or below this luminance carry no centroid weight.
    pub luminance_floor: u8,
}

impl Default for TailParams {
    fn default() -> Self {
        Self {
            start: (160.0, 80.0),
            length: (0.0, 120.0),
            n_segments: 8,
            window: 8,
            luminance_floor: 40,
        }
    }
}

/// Traces the tail as a chain of fixed-length segments, steering each one
/// toward the brightness centroid of a window ahead of the current point
/// (embedded fish appear bright on a dark background under IR).
///
/// Output columns: `tail_sum` (deflection of the tip heading relative to
/// the configured base direction, radians) followed by the absolute angle
/// `theta_i` of each segment.
pub struct TailDetector {
    params: TailParams,
    diagnostic: Option<GrayImage>,
}

impl TailDetector {
    pub fn new(params: TailParams) -> Self {
        Self {
            params,
            diagnostic: None,
        }
    }

    pub fn params(&self) -> &TailParams {
        &self.params
    }
}

impl Detector for TailDetector {
    fn name(&self) -> &str {
        "tail"
    }

    fn headers(&self) -> Vec<String> {
        let mut headers = vec!["tail_sum".to_string()];
        for i in 0..self.params.n_segments {
            headers.push(format!("theta_{:02}", i));
        }
        headers
    }

    fn detect(&mut self, image: &GrayImage, _ctx: &TrackContext) -> Result<(String, Vec<f64>)> {
        let n = self.params.n_segments;
        let (lx, ly) = self.params.length;
        let total_len = (lx * lx + ly * ly).sqrt();
        if n == 0 || total_len <= 0.0 {
            return Ok(("tail: degenerate segment geometry; ".to_string(), sentinel_row(n + 1)));
        }
        let seg_len = total_len / n as f32;
        let base = ly.atan2(lx);

        let mut trace = image.as_raw().clone();
        let mut dir = base;
        let mut pos = self.params.start;
        let mut thetas = Vec::with_capacity(n);
        let mut message = String::new();

        for i in 0..n {
            let probe = (pos.0 + seg_len * dir.cos(), pos.1 + seg_len * dir.sin());
            match brightness_centroid(image, probe, self.params.window, self.params.luminance_floor)
            {
                Some((cx, cy)) => {
                    let target = (cy - pos.1).atan2(cx - pos.0);
                    // Restrict each turn to a quarter circle so a stray bright
                    // spot cannot fold the trace back on itself.
                    let delta = wrap_angle(target - dir).clamp(-FRAC_PI_2, FRAC_PI_2);
                    dir += delta;
                }
                None if i == 0 => {
                    // Nothing at the tail base: the whole frame is a miss.
                    return Ok((
                        "tail: no signal at tail base; ".to_string(),
                        sentinel_row(n + 1),
                    ));
                }
                None => {
                    // Lost the tail partway: coast straight and note it once.
                    if message.is_empty() {
                        message = format!("tail: lost signal at segment {}; ", i);
                    }
                }
            }
            pos = (pos.0 + seg_len * dir.cos(), pos.1 + seg_len * dir.sin());
            thetas.push(dir as f64);
            mark_point(&mut trace, image.width(), image.height(), pos);
        }

        self.diagnostic = GrayImage::from_raw(image.width(), image.height(), trace);

        let mut values = Vec::with_capacity(n + 1);
        values.push((dir - base) as f64);
        values.extend(thetas);
        Ok((message, values))
    }

    fn reset_state(&mut self) {
        self.diagnostic = None;
    }

    fn diagnostic_name(&self) -> &'static str {
        "tail_trace"
    }

    fn diagnostic_image(&self) -> Option<&GrayImage> {
        self.diagnostic.as_ref()
    }

    fn apply_update(&mut self, update: &ControlUpdate) -> UpdateOutcome {
        match *update {
            ControlUpdate::TailStart { x, y } => {
                self.params.start = (x, y);
                UpdateOutcome::Applied
            }
            ControlUpdate::TailLength { x, y } => {
                self.params.length = (x, y);
                UpdateOutcome::Applied
            }
            ControlUpdate::TailSegments(n) => {
                self.params.n_segments = n;
                UpdateOutcome::AppliedStructural
            }
            _ => UpdateOutcome::Ignored,
        }
    }
}

/// Intensity-weighted centroid of the window around `center`, or `None`
/// when no pixel rises above the luminance floor.
fn brightness_centroid(
    image: &GrayImage,
    center: (f32, f32),
    window: u32,
    floor: u8,
) -> Option<(f32, f32)> {
    let (w, h) = (image.width() as i64, image.height() as i64);
    let cx = center.0.round() as i64;
    let cy = center.1.round() as i64;
    let r = window as i64;

    let x0 = (cx - r).max(0);
    let x1 = (cx + r).min(w - 1);
    let y0 = (cy - r).max(0);
    let y1 = (cy + r).min(h - 1);
    if x0 > x1 || y0 > y1 {
        return None;
    }

    let mut sum = 0.0f32;
    let mut sx = 0.0f32;
    let mut sy = 0.0f32;
    for y in y0..=y1 {
        for x in x0..=x1 {
            let p = image.get_pixel(x as u32, y as u32)[0];
            if p > floor {
                let weight = (p - floor) as f32;
                sum += weight;
                sx += weight * x as f32;
                sy += weight * y as f32;
            }
        }
    }
    if sum <= 0.0 {
        None
    } else {
        Some((sx / sum, sy / sum))
    }
}

fn wrap_angle(a: f32) -> f32 {
    (a + PI).rem_euclid(2.0 * PI) - PI
}

fn mark_point(buffer: &mut [u8], width: u32, height: u32, pos: (f32, f32)) {
    let x = pos.0.round() as i64;
    let y = pos.1.round() as i64;
    for dy in -1..=1i64 {
        for dx in -1..=1i64 {
            let (px, py) = (x + dx, y + dy);
            if px >= 0 && py >= 0 && (px as u32) < width && (py as u32) < height {
                buffer[(py as u32 * width + px as u32) as usize] = 255;
            }
        }
    }
}
