use anyhow::Result;
use image::{GrayImage, Luma};
use imageproc::region_labelling::{connected_components, Connectivity};
use serde::{Deserialize, Serialize};

use crate::types::sentinel_row;

use super::{ControlUpdate, Detector, TrackContext, UpdateOutcome};

/// Parameters for the eye ellipse tracker. The ROI is the eyes window the
/// GUI lets the user drag over the head.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct EyeParams {
    pub roi_pos: (u32, u32),
    pub roi_size: (u32, u32),
    /// Pixels at or above this luminance belong to an eye blob.
    pub threshold: u8,
    /// Area band (in pixels) a blob must fall in to count as an eye.
    pub min_area: u32,
    pub max_area: u32,
}

impl Default for EyeParams {
    fn default() -> Self {
        Self {
            roi_pos: (120, 30),
            roi_size: (80, 50),
            threshold: 120,
            min_area: 8,
            max_area: 2000,
        }
    }
}

/// Second-order moments of one labelled blob.
#[derive(Debug, Clone, Copy, Default)]
struct Blob {
    area: u32,
    sx: f64,
    sy: f64,
    sxx: f64,
    syy: f64,
    sxy: f64,
}

/// An ellipse fitted to a blob: centre, full axis lengths, orientation in
/// degrees. Coordinates are ROI-relative, matching the original tracker
/// (the display collaborator adds the ROI offset when overlaying).
#[derive(Debug, Clone, Copy)]
pub struct EyeEllipse {
    pub pos_x: f64,
    pub pos_y: f64,
    pub dim_x: f64,
    pub dim_y: f64,
    pub theta_deg: f64,
}

/// Finds the two eyes inside the ROI by thresholding, labelling connected
/// components, keeping the two largest blobs in the area band and fitting
/// an ellipse to each from its image moments.
///
/// Output columns, eyes ordered left to right:
/// `pos_x_e0, pos_y_e0, dim_x_e0, dim_y_e0, th_e0` and the same for `e1`.
pub struct EyeDetector {
    params: EyeParams,
    diagnostic: Option<GrayImage>,
}

impl EyeDetector {
    pub fn new(params: EyeParams) -> Self {
        Self {
            params,
            diagnostic: None,
        }
    }

    pub fn params(&self) -> &EyeParams {
        &self.params
    }
}

const FIELDS_PER_EYE: usize = 5;
const N_EYES: usize = 2;

impl Detector for EyeDetector {
    fn name(&self) -> &str {
        "eyes"
    }

    fn headers(&self) -> Vec<String> {
        let mut headers = Vec::with_capacity(N_EYES * FIELDS_PER_EYE);
        for i in 0..N_EYES {
            headers.push(format!("pos_x_e{}", i));
            headers.push(format!("pos_y_e{}", i));
            headers.push(format!("dim_x_e{}", i));
            headers.push(format!("dim_y_e{}", i));
            headers.push(format!("th_e{}", i));
        }
        headers
    }

    fn detect(&mut self, image: &GrayImage, _ctx: &TrackContext) -> Result<(String, Vec<f64>)> {
        let roi = crop_roi(image, self.params.roi_pos, self.params.roi_size);
        let roi = match roi {
            Some(roi) => roi,
            None => {
                self.diagnostic = None;
                return Ok((
                    "eyes: ROI outside the frame; ".to_string(),
                    sentinel_row(N_EYES * FIELDS_PER_EYE),
                ));
            }
        };

        // Threshold to a binary mask, kept as the diagnostic image.
        let mut mask = GrayImage::new(roi.width(), roi.height());
        for (m, p) in mask.pixels_mut().zip(roi.pixels()) {
            m.0[0] = if p.0[0] >= self.params.threshold { 255 } else { 0 };
        }

        let labels = connected_components(&mask, Connectivity::Eight, Luma([0u8]));
        let mut blobs: Vec<Blob> = Vec::new();
        for (x, y, label) in labels.enumerate_pixels() {
            let id = label.0[0] as usize;
            if id == 0 {
                continue;
            }
            if blobs.len() < id {
                blobs.resize(id, Blob::default());
            }
            let b = &mut blobs[id - 1];
            b.area += 1;
            b.sx += x as f64;
            b.sy += y as f64;
            b.sxx += (x as f64) * (x as f64);
            b.syy += (y as f64) * (y as f64);
            b.sxy += (x as f64) * (y as f64);
        }
        self.diagnostic = Some(mask);

        blobs.retain(|b| b.area >= self.params.min_area && b.area <= self.params.max_area);
        if blobs.len() < N_EYES {
            return Ok((
                format!("eyes: found {} of {} blobs; ", blobs.len(), N_EYES),
                sentinel_row(N_EYES * FIELDS_PER_EYE),
            ));
        }
        blobs.sort_by(|a, b| b.area.cmp(&a.area));
        blobs.truncate(N_EYES);
        // Stable eye identity: e0 is the leftmost of the two.
        blobs.sort_by(|a, b| {
            let ax = a.sx / a.area as f64;
            let bx = b.sx / b.area as f64;
            ax.total_cmp(&bx)
        });

        let mut values = Vec::with_capacity(N_EYES * FIELDS_PER_EYE);
        for blob in &blobs {
            let e = fit_ellipse(blob);
            values.push(e.pos_x);
            values.push(e.pos_y);
            values.push(e.dim_x);
            values.push(e.dim_y);
            values.push(e.theta_deg);
        }
        Ok((String::new(), values))
    }

    fn reset_state(&mut self) {
        self.diagnostic = None;
    }

    fn diagnostic_name(&self) -> &'static str {
        "thresholded"
    }

    fn diagnostic_image(&self) -> Option<&GrayImage> {
        self.diagnostic.as_ref()
    }

    fn apply_update(&mut self, update: &ControlUpdate) -> UpdateOutcome {
        match *update {
            ControlUpdate::EyeRoiPos { x, y } => {
                self.params.roi_pos = (x, y);
                UpdateOutcome::Applied
            }
            ControlUpdate::EyeRoiSize { w, h } => {
                self.params.roi_size = (w, h);
                UpdateOutcome::Applied
            }
            ControlUpdate::EyeThreshold(v) => {
                self.params.threshold = v;
                UpdateOutcome::Applied
            }
            _ => UpdateOutcome::Ignored,
        }
    }
}

/// Clamped ROI crop; `None` when the ROI misses the frame entirely.
fn crop_roi(image: &GrayImage, pos: (u32, u32), size: (u32, u32)) -> Option<GrayImage> {
    if pos.0 >= image.width() || pos.1 >= image.height() || size.0 == 0 || size.1 == 0 {
        return None;
    }
    let w = size.0.min(image.width() - pos.0);
    let h = size.1.min(image.height() - pos.1);
    let mut roi = GrayImage::new(w, h);
    for y in 0..h {
        for x in 0..w {
            roi.put_pixel(x, y, *image.get_pixel(pos.0 + x, pos.1 + y));
        }
    }
    Some(roi)
}

/// Ellipse from blob moments: eigen-decomposition of the 2x2 covariance of
/// the member pixel coordinates. Axis lengths are 4*sqrt(eigenvalue),
/// covering ~95% of the mass of a filled ellipse.
fn fit_ellipse(blob: &Blob) -> EyeEllipse {
    let n = blob.area as f64;
    let cx = blob.sx / n;
    let cy = blob.sy / n;
    let mxx = blob.sxx / n - cx * cx;
    let myy = blob.syy / n - cy * cy;
    let mxy = blob.sxy / n - cx * cy;

    let half_trace = (mxx + myy) / 2.0;
    let det_root = (((mxx - myy) / 2.0).powi(2) + mxy * mxy).sqrt();
    let l_major = (half_trace + det_root).max(0.0);
    let l_minor = (half_trace - det_root).max(0.0);
    let theta = 0.5 * (2.0 * mxy).atan2(mxx - myy);

    EyeEllipse {
        pos_x: cx,
        pos_y: cy,
        dim_x: 4.0 * l_major.sqrt(),
        dim_y: 4.0 * l_minor.sqrt(),
        theta_deg: theta.to_degrees(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TrackContext {
        TrackContext { t: 0.0 }
    }

    fn paint_disc(image: &mut GrayImage, cx: i32, cy: i32, r: i32) {
        for y in (cy - r)..=(cy + r) {
            for x in (cx - r)..=(cx + r) {
                if x >= 0
                    && y >= 0
                    && (x as u32) < image.width()
                    && (y as u32) < image.height()
                    && (x - cx).pow(2) + (y - cy).pow(2) <= r * r
                {
                    image.put_pixel(x as u32, y as u32, Luma([255]));
                }
            }
        }
    }

    fn two_eye_frame() -> GrayImage {
        let mut image = GrayImage::new(100, 60);
        paint_disc(&mut image, 30, 25, 4);
        paint_disc(&mut image, 60, 25, 4);
        image
    }

    fn params() -> EyeParams {
        EyeParams {
            roi_pos: (10, 10),
            roi_size: (80, 40),
            threshold: 120,
            min_area: 8,
            max_area: 500,
        }
    }

    #[test]
    fn declares_ten_fields() {
        let det = EyeDetector::new(EyeParams::default());
        assert_eq!(det.field_count(), 10);
        assert_eq!(
            det.headers()[..5],
            ["pos_x_e0", "pos_y_e0", "dim_x_e0", "dim_y_e0", "th_e0"]
        );
    }

    #[test]
    fn finds_both_eyes_left_to_right() {
        let image = two_eye_frame();
        let mut det = EyeDetector::new(params());
        let (message, values) = det.detect(&image, &ctx()).unwrap();
        assert!(message.is_empty(), "unexpected failure: {}", message);
        assert_eq!(values.len(), 10);

        // ROI-relative centres: discs at frame (30,25) and (60,25), ROI at (10,10).
        assert!((values[0] - 20.0).abs() < 1.5, "e0 x = {}", values[0]);
        assert!((values[1] - 15.0).abs() < 1.5, "e0 y = {}", values[1]);
        assert!((values[5] - 50.0).abs() < 1.5, "e1 x = {}", values[5]);
        assert!((values[6] - 15.0).abs() < 1.5, "e1 y = {}", values[6]);

        // A disc of radius 4 has both axis lengths close to its diameter.
        for &dim in &[values[2], values[3], values[7], values[8]] {
            assert!((4.0..12.0).contains(&dim), "axis length {} implausible", dim);
        }
    }

    #[test]
    fn single_blob_degrades_to_sentinels() {
        let mut image = GrayImage::new(100, 60);
        paint_disc(&mut image, 30, 25, 4);
        let mut det = EyeDetector::new(params());
        let (message, values) = det.detect(&image, &ctx()).unwrap();
        assert!(message.contains("found 1 of 2"));
        assert_eq!(values.len(), 10);
        assert!(values.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn roi_off_frame_degrades_to_sentinels() {
        let image = two_eye_frame();
        let mut det = EyeDetector::new(EyeParams {
            roi_pos: (500, 500),
            ..params()
        });
        let (message, values) = det.detect(&image, &ctx()).unwrap();
        assert!(!message.is_empty());
        assert!(values.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn thresholded_diagnostic_matches_roi_size() {
        let image = two_eye_frame();
        let mut det = EyeDetector::new(params());
        det.detect(&image, &ctx()).unwrap();
        let diag = det.diagnostic_image().expect("diagnostic after detect");
        assert_eq!((diag.width(), diag.height()), (80, 40));
        assert_eq!(det.diagnostic_name(), "thresholded");
    }

    #[test]
    fn elongated_blob_reports_orientation() {
        // A horizontal bar: major axis along x, orientation near 0 degrees.
        let mut image = GrayImage::new(100, 60);
        for y in 23..28 {
            for x in 25..45 {
                image.put_pixel(x, y, Luma([255]));
            }
        }
        paint_disc(&mut image, 70, 25, 4);

        let mut det = EyeDetector::new(params());
        let (message, values) = det.detect(&image, &ctx()).unwrap();
        assert!(message.is_empty(), "unexpected failure: {}", message);
        assert!(values[2] > values[3], "major axis should exceed minor");
        assert!(values[4].abs() < 10.0, "orientation {} not horizontal", values[4]);
    }
}
