use anyhow::{bail, Result};
use image::GrayImage;

use super::{ControlUpdate, Detector, TrackContext, UpdateOutcome};

/// Probe frame used to validate member schemas at construction time.
const PROBE_SIZE: u32 = 16;

/// Ordered composition of detectors presenting the single-detector contract.
///
/// For every frame each member runs in order on the same image; diagnostic
/// messages and result tuples are concatenated order-preserving, so the
/// combined output always matches the concatenated header list. A member
/// whose output width disagrees with its declared headers is a fatal
/// configuration error, caught here at construction (and again at runtime,
/// should a detector misbehave only on real frames).
pub struct DetectorChain {
    members: Vec<Box<dyn Detector>>,
    monitored: Vec<String>,
    display_mode: Option<String>,
}

impl std::fmt::Debug for DetectorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectorChain")
            .field(
                "members",
                &self.members.iter().map(|m| m.name().to_string()).collect::<Vec<_>>(),
            )
            .field("monitored", &self.monitored)
            .field("display_mode", &self.display_mode)
            .finish()
    }
}

impl DetectorChain {
    /// Build and validate a chain. `monitored` is the subset of columns
    /// surfaced for live feedback plots; every entry must exist in the
    /// combined schema.
    pub fn new(members: Vec<Box<dyn Detector>>, monitored: Vec<String>) -> Result<Self> {
        let mut chain = Self {
            members,
            monitored,
            display_mode: None,
        };
        chain.validate()?;
        Ok(chain)
    }

    /// Run every member against a blank probe frame and check that each
    /// honours its declared field count, then check the monitored subset.
    pub fn validate(&mut self) -> Result<()> {
        let probe = GrayImage::new(PROBE_SIZE, PROBE_SIZE);
        let ctx = TrackContext { t: 0.0 };
        for member in &mut self.members {
            let declared = member.field_count();
            let (_, values) = member.detect(&probe, &ctx)?;
            if values.len() != declared {
                bail!(
                    "detector '{}' declares {} fields but produced {}",
                    member.name(),
                    declared,
                    values.len()
                );
            }
            member.reset_state();
        }

        let headers = self.accumulator_headers();
        for name in &self.monitored {
            if !headers.iter().any(|h| h == name) {
                bail!("monitored column '{}' is not in the chain schema", name);
            }
        }
        Ok(())
    }

    /// Combined column schema, in chain order.
    pub fn accumulator_headers(&self) -> Vec<String> {
        self.members.iter().flat_map(|m| m.headers()).collect()
    }

    /// Columns surfaced for live feedback (e.g. the tail-sum plot).
    pub fn monitored_headers(&self) -> &[String] {
        &self.monitored
    }

    /// Valid display-mode keys, one per member.
    pub fn diagnostic_names(&self) -> Vec<&'static str> {
        self.members.iter().map(|m| m.diagnostic_name()).collect()
    }

    pub fn display_mode(&self) -> Option<&str> {
        self.display_mode.as_deref()
    }
}

impl Detector for DetectorChain {
    fn name(&self) -> &str {
        "chain"
    }

    fn headers(&self) -> Vec<String> {
        self.accumulator_headers()
    }

    fn detect(&mut self, image: &GrayImage, ctx: &TrackContext) -> Result<(String, Vec<f64>)> {
        let mut message = String::new();
        let mut values = Vec::with_capacity(self.field_count());
        for member in &mut self.members {
            let declared = member.field_count();
            let (m, mut v) = member.detect(image, ctx)?;
            if v.len() != declared {
                bail!(
                    "detector '{}' declares {} fields but produced {}",
                    member.name(),
                    declared,
                    v.len()
                );
            }
            message.push_str(&m);
            values.append(&mut v);
        }
        Ok((message, values))
    }

    fn reset_state(&mut self) {
        for member in &mut self.members {
            member.reset_state();
        }
    }

    fn diagnostic_name(&self) -> &'static str {
        "chain"
    }

    /// The diagnostic image of whichever member matches the selected
    /// display mode; none selected (or no match) means raw frames.
    fn diagnostic_image(&self) -> Option<&GrayImage> {
        let key = self.display_mode.as_deref()?;
        self.members
            .iter()
            .find(|m| m.diagnostic_name() == key)
            .and_then(|m| m.diagnostic_image())
    }

    fn apply_update(&mut self, update: &ControlUpdate) -> UpdateOutcome {
        if let ControlUpdate::DisplayMode(mode) = update {
            self.display_mode = mode.clone();
            return UpdateOutcome::Applied;
        }
        let mut outcome = UpdateOutcome::Ignored;
        for member in &mut self.members {
            match member.apply_update(update) {
                UpdateOutcome::AppliedStructural => outcome = UpdateOutcome::AppliedStructural,
                UpdateOutcome::Applied if outcome == UpdateOutcome::Ignored => {
                    outcome = UpdateOutcome::Applied
                }
                _ => {}
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::{EyeDetector, EyeParams, TailDetector, TailParams};
    use crate::types::sentinel_row;

    /// Test stub with a fixed declared width and scripted behaviour.
    struct Stub {
        name: &'static str,
        declared: usize,
        produced: usize,
        fail: bool,
    }

    impl Stub {
        fn honest(name: &'static str, width: usize) -> Self {
            Self {
                name,
                declared: width,
                produced: width,
                fail: false,
            }
        }
    }

    impl Detector for Stub {
        fn name(&self) -> &str {
            self.name
        }
        fn headers(&self) -> Vec<String> {
            (0..self.declared)
                .map(|i| format!("{}_{}", self.name, i))
                .collect()
        }
        fn detect(&mut self, _: &GrayImage, _: &TrackContext) -> Result<(String, Vec<f64>)> {
            if self.fail {
                return Ok((format!("{}: failed; ", self.name), sentinel_row(self.produced)));
            }
            Ok((String::new(), (0..self.produced).map(|i| i as f64).collect()))
        }
        fn reset_state(&mut self) {}
        fn diagnostic_name(&self) -> &'static str {
            self.name
        }
        fn diagnostic_image(&self) -> Option<&GrayImage> {
            None
        }
        fn apply_update(&mut self, _: &ControlUpdate) -> UpdateOutcome {
            UpdateOutcome::Ignored
        }
    }

    fn ctx() -> TrackContext {
        TrackContext { t: 0.0 }
    }

    #[test]
    fn schema_is_ordered_concatenation() {
        let chain = DetectorChain::new(
            vec![
                Box::new(Stub::honest("a", 2)),
                Box::new(Stub::honest("b", 3)),
            ],
            vec!["a_0".to_string(), "b_2".to_string()],
        )
        .unwrap();
        assert_eq!(chain.accumulator_headers(), ["a_0", "a_1", "b_0", "b_1", "b_2"]);
        assert_eq!(chain.field_count(), 5);
    }

    #[test]
    fn lying_member_fails_construction() {
        let lying = Stub {
            name: "liar",
            declared: 3,
            produced: 2,
            fail: false,
        };
        let err = DetectorChain::new(vec![Box::new(lying)], vec![]).unwrap_err();
        assert!(err.to_string().contains("declares 3 fields but produced 2"));
    }

    #[test]
    fn unknown_monitored_column_fails_construction() {
        let err = DetectorChain::new(
            vec![Box::new(Stub::honest("a", 2))],
            vec!["nope".to_string()],
        )
        .unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn failing_member_keeps_neighbours_intact() {
        let failing = Stub {
            name: "bad",
            declared: 2,
            produced: 2,
            fail: true,
        };
        let mut chain = DetectorChain::new(
            vec![Box::new(failing), Box::new(Stub::honest("good", 3))],
            vec![],
        )
        .unwrap();

        let (message, values) = chain.detect(&GrayImage::new(8, 8), &ctx()).unwrap();
        assert!(message.contains("bad: failed"));
        assert_eq!(values.len(), 5);
        assert!(values[0].is_nan() && values[1].is_nan());
        assert_eq!(&values[2..], &[0.0, 1.0, 2.0]);
    }

    #[test]
    fn tail_eyes_chain_has_thirteen_columns() {
        // The canonical configuration: a two-segment tail detector (3 fields)
        // followed by the eye detector (10 fields).
        let chain = DetectorChain::new(
            vec![
                Box::new(TailDetector::new(TailParams {
                    n_segments: 2,
                    ..TailParams::default()
                })),
                Box::new(EyeDetector::new(EyeParams::default())),
            ],
            vec!["tail_sum".to_string(), "th_e0".to_string(), "th_e1".to_string()],
        )
        .unwrap();

        let headers = chain.accumulator_headers();
        assert_eq!(headers.len(), 13);
        assert_eq!(&headers[..3], &["tail_sum", "theta_00", "theta_01"]);
        assert_eq!(headers[3], "pos_x_e0");
        assert_eq!(headers[12], "th_e1");
    }

    #[test]
    fn one_frame_yields_full_width_row() {
        let mut chain = DetectorChain::new(
            vec![
                Box::new(TailDetector::new(TailParams {
                    n_segments: 2,
                    ..TailParams::default()
                })),
                Box::new(EyeDetector::new(EyeParams::default())),
            ],
            vec![],
        )
        .unwrap();
        let (_, values) = chain.detect(&GrayImage::new(320, 240), &ctx()).unwrap();
        assert_eq!(values.len(), 13);
    }

    #[test]
    fn structural_update_changes_schema() {
        let mut chain = DetectorChain::new(
            vec![Box::new(TailDetector::new(TailParams {
                n_segments: 2,
                ..TailParams::default()
            }))],
            vec![],
        )
        .unwrap();
        assert_eq!(chain.field_count(), 3);
        let outcome = chain.apply_update(&ControlUpdate::TailSegments(4));
        assert_eq!(outcome, UpdateOutcome::AppliedStructural);
        assert_eq!(chain.field_count(), 5);
        chain.validate().unwrap();
    }

    #[test]
    fn display_mode_selects_member_diagnostic() {
        let mut chain = DetectorChain::new(
            vec![
                Box::new(TailDetector::new(TailParams::default())),
                Box::new(EyeDetector::new(EyeParams::default())),
            ],
            vec![],
        )
        .unwrap();
        assert_eq!(chain.diagnostic_names(), ["tail_trace", "thresholded"]);

        // Default: no diagnostic selected.
        chain.detect(&GrayImage::new(320, 240), &ctx()).unwrap();
        assert!(chain.diagnostic_image().is_none());

        chain.apply_update(&ControlUpdate::DisplayMode(Some("thresholded".to_string())));
        chain.detect(&GrayImage::new(320, 240), &ctx()).unwrap();
        assert!(chain.diagnostic_image().is_some());

        chain.apply_update(&ControlUpdate::DisplayMode(None));
        assert!(chain.diagnostic_image().is_none());
    }

    #[test]
    fn chain_detection_is_deterministic() {
        let image = GrayImage::new(64, 64);
        let mut a = DetectorChain::new(vec![Box::new(Stub::honest("a", 4))], vec![]).unwrap();
        let (_, first) = a.detect(&image, &ctx()).unwrap();
        let (_, second) = a.detect(&image, &ctx()).unwrap();
        assert_eq!(first, second);
    }
}
