use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::accumulator::{AppendOutcome, DataAccumulator};
use crate::display::{DisplayFrame, DisplaySender};
use crate::tracking::{ControlUpdate, Detector, DetectorChain, TrackContext, UpdateOutcome};
use crate::types::{Frame, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Idle,
    Running,
    Stopping,
}

const STATE_IDLE: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPING: u8 = 2;

/// Diagnostics the dispatcher emits instead of printing. The controller
/// (GUI or demo loop) drains these at its leisure.
#[derive(Debug, Clone)]
pub enum StatusEvent {
    Started,
    /// A detector could not track this frame; its fields went to sentinels.
    FrameFailure { t: Timestamp, message: String },
    /// A frame arrived with a non-increasing timestamp and was not stored.
    OutOfOrder { t: Timestamp },
    /// A structural parameter change regenerated the schema and emptied
    /// the accumulator.
    SchemaReset { columns: Vec<String> },
    /// No frames for well past the expected interval; still polling.
    SourceStalled { silent_for: f64 },
    SourceRecovered,
    /// Unrecoverable pipeline error; the worker has shut down.
    Fatal { error: String },
    Stopped { frames_processed: u64 },
}

#[derive(Debug, Clone, Copy)]
pub struct DispatcherOptions {
    /// How long one poll of the frame channel may block.
    pub poll_timeout: Duration,
    /// Silence longer than this raises `SourceStalled`.
    pub stall_after: Duration,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(20),
            stall_after: Duration::from_secs(2),
        }
    }
}

/// The scheduling core. Owns a worker thread that pulls frames from the
/// source channel, applies pending control updates between frames, runs
/// the detector chain, appends to the accumulator and publishes to the
/// drop-oldest display channel. `Idle -> Running -> Stopping -> Idle`.
pub struct FrameDispatcher {
    worker: Option<JoinHandle<()>>,
    state: Arc<AtomicU8>,
    control_tx: Sender<ControlUpdate>,
    status_rx: Receiver<StatusEvent>,
}

impl FrameDispatcher {
    pub fn start(
        frames: Receiver<Frame>,
        chain: DetectorChain,
        accumulator: Arc<DataAccumulator>,
        display: DisplaySender,
        options: DispatcherOptions,
    ) -> Self {
        let state = Arc::new(AtomicU8::new(STATE_RUNNING));
        let (control_tx, control_rx) = unbounded::<ControlUpdate>();
        let (status_tx, status_rx) = unbounded::<StatusEvent>();

        let worker_state = state.clone();
        let worker = thread::spawn(move || {
            let mut worker = Worker {
                frames,
                chain,
                accumulator,
                display,
                control_rx,
                status_tx,
                options,
                state: worker_state,
                processed: 0,
            };
            if let Err(e) = worker.run() {
                let _ = worker.status_tx.send(StatusEvent::Fatal {
                    error: format!("{:#}", e),
                });
            }
            let _ = worker.status_tx.send(StatusEvent::Stopped {
                frames_processed: worker.processed,
            });
            worker.state.store(STATE_IDLE, Ordering::SeqCst);
        });

        Self {
            worker: Some(worker),
            state,
            control_tx,
            status_rx,
        }
    }

    pub fn state(&self) -> DispatcherState {
        match self.state.load(Ordering::SeqCst) {
            STATE_RUNNING => DispatcherState::Running,
            STATE_STOPPING => DispatcherState::Stopping,
            _ => DispatcherState::Idle,
        }
    }

    /// Handle for pushing parameter changes; applied between frames.
    pub fn control(&self) -> Sender<ControlUpdate> {
        self.control_tx.clone()
    }

    /// Status/diagnostic events, in emission order.
    pub fn status(&self) -> &Receiver<StatusEvent> {
        &self.status_rx
    }

    /// Cooperative shutdown: the worker finishes the frame in flight,
    /// flushes pending control updates and goes back to `Idle`.
    pub fn stop(mut self) {
        self.request_stop_and_join();
    }

    fn request_stop_and_join(&mut self) {
        let _ = self.state.compare_exchange(
            STATE_RUNNING,
            STATE_STOPPING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for FrameDispatcher {
    fn drop(&mut self) {
        self.request_stop_and_join();
    }
}

struct Worker {
    frames: Receiver<Frame>,
    chain: DetectorChain,
    accumulator: Arc<DataAccumulator>,
    display: DisplaySender,
    control_rx: Receiver<ControlUpdate>,
    status_tx: Sender<StatusEvent>,
    options: DispatcherOptions,
    state: Arc<AtomicU8>,
    processed: u64,
}

impl Worker {
    fn run(&mut self) -> Result<()> {
        let _ = self.status_tx.send(StatusEvent::Started);
        let mut last_frame_at = Instant::now();
        let mut stalled = false;

        loop {
            // Stop is observed at the top of the poll cycle only, so an
            // in-flight frame always completes and gets appended.
            if self.state.load(Ordering::SeqCst) == STATE_STOPPING {
                break;
            }

            match self.frames.recv_timeout(self.options.poll_timeout) {
                Ok(frame) => {
                    self.apply_pending_controls()?;
                    self.process_frame(&frame)?;
                    last_frame_at = Instant::now();
                    if stalled {
                        stalled = false;
                        let _ = self.status_tx.send(StatusEvent::SourceRecovered);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    // Source went away entirely. Keep polling at the same
                    // cadence; the stall watchdog reports the condition.
                    thread::sleep(self.options.poll_timeout);
                }
            }

            if !stalled && last_frame_at.elapsed() >= self.options.stall_after {
                stalled = true;
                let _ = self.status_tx.send(StatusEvent::SourceStalled {
                    silent_for: last_frame_at.elapsed().as_secs_f64(),
                });
            }
        }

        // Updates that raced the stop request still land, so a restart
        // resumes with a configuration-consistent chain.
        self.apply_pending_controls()?;
        Ok(())
    }

    fn process_frame(&mut self, frame: &Frame) -> Result<()> {
        let ctx = TrackContext { t: frame.t };
        let (message, values) = self.chain.detect(&frame.image, &ctx)?;
        if !message.is_empty() {
            let _ = self.status_tx.send(StatusEvent::FrameFailure {
                t: frame.t,
                message,
            });
        }

        match self.accumulator.append(frame.t, values)? {
            AppendOutcome::Appended => self.processed += 1,
            AppendOutcome::RejectedOutOfOrder => {
                let _ = self.status_tx.send(StatusEvent::OutOfOrder { t: frame.t });
            }
        }

        // Display gets the member diagnostic when a display mode is
        // selected, the shared raw frame otherwise.
        let display_frame = match self.chain.diagnostic_image() {
            Some(diag) => DisplayFrame {
                t: frame.t,
                image: Arc::new(diag.clone()),
            },
            None => DisplayFrame::from(frame),
        };
        self.display.send_latest(display_frame);
        Ok(())
    }

    /// Drain and apply every queued control update atomically with respect
    /// to frame processing. A structural change re-validates the chain and
    /// resets the accumulator to the regenerated schema.
    fn apply_pending_controls(&mut self) -> Result<()> {
        let mut structural = false;
        while let Ok(update) = self.control_rx.try_recv() {
            if self.chain.apply_update(&update) == UpdateOutcome::AppliedStructural {
                structural = true;
            }
        }
        if structural {
            self.chain.validate()?;
            self.chain.reset_state();
            let columns = self.chain.accumulator_headers();
            self.accumulator.reset(columns.clone());
            let _ = self.status_tx.send(StatusEvent::SchemaReset { columns });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::display_channel;
    use crate::source::{frame_channel, fish_frame};
    use crate::tracking::{EyeDetector, EyeParams, TailDetector, TailParams};

    fn test_chain() -> DetectorChain {
        DetectorChain::new(
            vec![
                Box::new(TailDetector::new(TailParams {
                    n_segments: 2,
                    ..TailParams::default()
                })),
                Box::new(EyeDetector::new(EyeParams::default())),
            ],
            vec!["tail_sum".to_string()],
        )
        .unwrap()
    }

    fn fast_options() -> DispatcherOptions {
        DispatcherOptions {
            poll_timeout: Duration::from_millis(5),
            stall_after: Duration::from_millis(100),
        }
    }

    /// Spin until `cond` holds, with a hard cap so a broken worker fails
    /// the test instead of hanging it.
    fn wait_until(cond: impl Fn() -> bool, what: &str) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn processes_every_frame_in_order() {
        let (tx, rx) = frame_channel(32);
        let chain = test_chain();
        let acc = Arc::new(DataAccumulator::new(chain.accumulator_headers()));
        let (display, _display_rx) = display_channel(1);
        let dispatcher =
            FrameDispatcher::start(rx, chain, acc.clone(), display, fast_options());

        for i in 0..20 {
            let t = 0.01 * (i + 1) as f64;
            tx.send(Frame::new(t, fish_frame(320, 240, t))).unwrap();
        }
        // Give the worker time to drain, then stop cooperatively.
        wait_until(|| acc.len() >= 20, "all frames to be processed");
        dispatcher.stop();

        assert_eq!(acc.len(), 20, "accumulation path must not drop frames");
        let rows = acc.latest(20);
        assert!(rows.windows(2).all(|w| w[1].t > w[0].t));
        assert!(rows.iter().all(|r| r.values.len() == 13));
    }

    #[test]
    fn out_of_order_frame_is_rejected_and_reported() {
        let (tx, rx) = frame_channel(8);
        let chain = test_chain();
        let acc = Arc::new(DataAccumulator::new(chain.accumulator_headers()));
        let (display, _display_rx) = display_channel(1);
        let dispatcher =
            FrameDispatcher::start(rx, chain, acc.clone(), display, fast_options());

        tx.send(Frame::new(0.2, fish_frame(320, 240, 0.0))).unwrap();
        tx.send(Frame::new(0.1, fish_frame(320, 240, 0.0))).unwrap();
        tx.send(Frame::new(0.3, fish_frame(320, 240, 0.0))).unwrap();
        wait_until(|| acc.len() >= 2, "in-order frames to be appended");
        dispatcher.stop();

        assert_eq!(acc.len(), 2);
        assert_eq!(acc.rejected(), 1);
    }

    #[test]
    fn structural_update_resets_the_accumulator_mid_run() {
        let (tx, rx) = frame_channel(8);
        let chain = test_chain();
        let acc = Arc::new(DataAccumulator::new(chain.accumulator_headers()));
        let (display, _display_rx) = display_channel(1);
        let dispatcher =
            FrameDispatcher::start(rx, chain, acc.clone(), display, fast_options());

        tx.send(Frame::new(0.1, fish_frame(320, 240, 0.0))).unwrap();
        wait_until(|| !acc.is_empty(), "first frame under the old schema");

        dispatcher
            .control()
            .send(ControlUpdate::TailSegments(4))
            .unwrap();
        tx.send(Frame::new(0.2, fish_frame(320, 240, 0.0))).unwrap();
        wait_until(
            || acc.headers().len() == 15 && !acc.is_empty(),
            "the post-reset row under the new schema",
        );
        dispatcher.stop();

        // Only post-reset rows remain, all with the new 15-column schema.
        let (headers, rows) = acc.snapshot();
        assert_eq!(headers.len(), 15);
        assert!(rows.iter().all(|r| r.values.len() == 15));
        assert_eq!(rows.len(), 1, "stale-schema rows must not survive a reset");
    }

    #[test]
    fn stall_is_reported_and_recovered_from() {
        let (tx, rx) = frame_channel(8);
        let chain = test_chain();
        let acc = Arc::new(DataAccumulator::new(chain.accumulator_headers()));
        let (display, _display_rx) = display_channel(1);
        let dispatcher =
            FrameDispatcher::start(rx, chain, acc.clone(), display, fast_options());
        let status = dispatcher.status().clone();

        // Silence past the watchdog threshold...
        thread::sleep(Duration::from_millis(250));
        // ...then frames again.
        tx.send(Frame::new(0.1, fish_frame(320, 240, 0.0))).unwrap();
        wait_until(|| !acc.is_empty(), "a frame after the stall");
        dispatcher.stop();

        assert_eq!(acc.len(), 1, "dispatcher must keep polling through a stall");
        let events: Vec<StatusEvent> = status.try_iter().collect();
        assert!(
            events.iter().any(|e| matches!(e, StatusEvent::SourceStalled { .. })),
            "expected a stall report, got {:?}",
            events
        );
        assert!(
            events.iter().any(|e| matches!(e, StatusEvent::SourceRecovered)),
            "expected a recovery report, got {:?}",
            events
        );
    }

    #[test]
    fn stop_returns_to_idle() {
        let (_tx, rx) = frame_channel(8);
        let chain = test_chain();
        let acc = Arc::new(DataAccumulator::new(chain.accumulator_headers()));
        let (display, _display_rx) = display_channel(1);
        let mut dispatcher =
            FrameDispatcher::start(rx, chain, acc, display, fast_options());

        assert_eq!(dispatcher.state(), DispatcherState::Running);
        dispatcher.request_stop_and_join();
        assert_eq!(dispatcher.state(), DispatcherState::Idle);
    }
}
