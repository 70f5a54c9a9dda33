use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use image::{GrayImage, Luma};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::types::Frame;

/// Camera-side control updates (consumed by the camera layer; the core only
/// defines the channel). The synthetic source honours `Framerate` and
/// `Gain`, which is enough to exercise the contract.
#[derive(Debug, Clone, Copy)]
pub enum CameraControl {
    Exposure(f64),
    Gain(f64),
    Framerate(f64),
}

/// The frame channel binding a source to the dispatcher. Bounded so a
/// stalled dispatcher back-pressures the source instead of buffering
/// unboundedly.
pub fn frame_channel(capacity: usize) -> (Sender<Frame>, Receiver<Frame>) {
    bounded(capacity.max(1))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceParams {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Tail-beat frequency of the synthetic fish, Hz.
    pub tail_beat_hz: f64,
    /// Peak random noise added per pixel.
    pub noise: u8,
}

impl Default for SourceParams {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            fps: 60.0,
            tail_beat_hz: 2.0,
            noise: 5,
        }
    }
}

/// Stand-in for a camera when no hardware is present: a worker thread
/// emitting timestamped frames of a synthetic fish whose tail beats
/// sinusoidally, at the configured rate. Geometry matches the default
/// tracking parameters so the demo tracks out of the box.
pub struct SyntheticSource {
    worker: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    control_tx: Sender<CameraControl>,
}

impl SyntheticSource {
    pub fn start(params: SourceParams, tx: Sender<Frame>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let (control_tx, control_rx) = unbounded::<CameraControl>();

        let stop_flag = stop.clone();
        let worker = thread::spawn(move || {
            run_source(params, tx, control_rx, stop_flag);
        });

        Self {
            worker: Some(worker),
            stop,
            control_tx,
        }
    }

    /// Channel the camera-parameter GUI writes into.
    pub fn control(&self) -> Sender<CameraControl> {
        self.control_tx.clone()
    }

    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for SyntheticSource {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_source(
    params: SourceParams,
    tx: Sender<Frame>,
    control_rx: Receiver<CameraControl>,
    stop: Arc<AtomicBool>,
) {
    let t0 = Instant::now();
    let mut period = Duration::from_secs_f64(1.0 / params.fps.max(1.0));
    let mut gain = 1.0f64;
    let mut next_tick = Instant::now();
    let mut rng = rand::thread_rng();

    while !stop.load(Ordering::SeqCst) {
        while let Ok(update) = control_rx.try_recv() {
            match update {
                CameraControl::Framerate(fps) if fps > 0.0 => {
                    period = Duration::from_secs_f64(1.0 / fps);
                }
                CameraControl::Gain(g) if g > 0.0 => gain = g,
                // Exposure has no meaning for a synthetic pattern.
                _ => {}
            }
        }

        let t = t0.elapsed().as_secs_f64();
        let phase = 2.0 * std::f64::consts::PI * params.tail_beat_hz * t;
        let mut image = fish_frame(params.width, params.height, phase);
        if gain != 1.0 || params.noise > 0 {
            for p in image.pixels_mut() {
                let noise = if params.noise > 0 {
                    rng.gen_range(0..=params.noise) as f64
                } else {
                    0.0
                };
                p.0[0] = (p.0[0] as f64 * gain + noise).round().clamp(0.0, 255.0) as u8;
            }
        }

        // Ownership of the frame moves to the dispatcher here. A closed
        // channel means the pipeline is gone and the source can retire.
        if tx.send(Frame::new(t, image)).is_err() {
            break;
        }

        next_tick += period;
        let now = Instant::now();
        if next_tick > now {
            thread::sleep(next_tick - now);
        } else {
            // Fell behind (consumer back-pressure); re-anchor the clock
            // rather than bursting to catch up.
            next_tick = now;
        }
    }
}

/// One synthetic frame: two bright eye blobs above a tail that beats with
/// `phase`. The geometry lines up with `TailParams::default` and
/// `EyeParams::default`.
pub fn fish_frame(width: u32, height: u32, phase: f64) -> GrayImage {
    let mut image = GrayImage::new(width, height);

    // Eyes.
    draw_disc(&mut image, 145.0, 55.0, 5.0, 230);
    draw_disc(&mut image, 175.0, 55.0, 5.0, 230);

    // Tail: 8 segments of 15px starting straight down from (160, 80),
    // bending progressively with the beat.
    let bend = 0.45 * phase.sin() as f32;
    let mut pos = (160.0f32, 80.0f32);
    let mut prev = pos;
    let n = 8;
    for i in 0..n {
        let angle = std::f32::consts::FRAC_PI_2 + bend * (i as f32 + 1.0) / n as f32;
        pos = (pos.0 + 15.0 * angle.cos(), pos.1 + 15.0 * angle.sin());
        draw_segment(&mut image, prev, pos, 200);
        prev = pos;
    }

    image
}

fn draw_disc(image: &mut GrayImage, cx: f32, cy: f32, r: f32, value: u8) {
    let x0 = (cx - r).floor().max(0.0) as u32;
    let x1 = ((cx + r).ceil() as u32).min(image.width().saturating_sub(1));
    let y0 = (cy - r).floor().max(0.0) as u32;
    let y1 = ((cy + r).ceil() as u32).min(image.height().saturating_sub(1));
    for y in y0..=y1 {
        for x in x0..=x1 {
            let dx = x as f32 - cx;
            let dy = y as f32 - cy;
            if dx * dx + dy * dy <= r * r {
                image.put_pixel(x, y, Luma([value]));
            }
        }
    }
}

fn draw_segment(image: &mut GrayImage, from: (f32, f32), to: (f32, f32), value: u8) {
    let steps = ((to.0 - from.0).abs().max((to.1 - from.1).abs()).ceil() as usize).max(1);
    for s in 0..=steps {
        let f = s as f32 / steps as f32;
        let x = from.0 + (to.0 - from.0) * f;
        let y = from.1 + (to.1 - from.1) * f;
        for dy in -1..=1i32 {
            for dx in -1..=1i32 {
                let px = x.round() as i32 + dx;
                let py = y.round() as i32 + dy;
                if px >= 0 && py >= 0 && (px as u32) < image.width() && (py as u32) < image.height()
                {
                    image.put_pixel(px as u32, py as u32, Luma([value]));
                }
            }
        }
    }
}
