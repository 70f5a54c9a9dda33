//! Closed-loop behavioral tracking for head-embedded fish: a camera-style
//! frame source feeding a dispatcher that runs a chain of pose detectors
//! (tail curvature, eye ellipses) on every frame, accumulates timestamped
//! results for analysis and closed-loop stimulation, and publishes frames
//! to a drop-oldest display channel that favours freshness over
//! completeness.

pub mod accumulator;
pub mod args;
pub mod config;
pub mod dispatcher;
pub mod display;
pub mod source;
pub mod tracking;
pub mod types;

pub use accumulator::{AppendOutcome, DataAccumulator, Entry};
pub use config::TrackingConfig;
pub use dispatcher::{DispatcherOptions, DispatcherState, FrameDispatcher, StatusEvent};
pub use display::{display_channel, DisplayFrame, DisplaySender};
pub use source::{frame_channel, CameraControl, SourceParams, SyntheticSource};
pub use tracking::{
    ControlUpdate, Detector, DetectorChain, EyeDetector, EyeParams, TailDetector, TailParams,
    TrackContext, UpdateOutcome,
};
pub use types::{Frame, Timestamp, SENTINEL};
