use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use colored::*;

use fintrack::args::Args;
use fintrack::{
    display_channel, frame_channel, ControlUpdate, DataAccumulator, DetectorChain,
    DispatcherOptions, EyeDetector, FrameDispatcher, StatusEvent, SyntheticSource, TailDetector,
    TrackingConfig,
};

fn build_chain(config: &TrackingConfig) -> Result<DetectorChain> {
    DetectorChain::new(
        vec![
            Box::new(TailDetector::new(config.tail)),
            Box::new(EyeDetector::new(config.eyes)),
        ],
        config.monitored_headers.clone(),
    )
}

fn main() -> Result<()> {
    let args = Args::parse();

    // 0. Load Config
    let mut config = TrackingConfig::load(&args.config)?;
    if let Some(fps) = args.fps {
        config.source.fps = fps;
    }

    // 1. Build the detector chain
    let chain = build_chain(&config)?;
    let headers = chain.accumulator_headers();
    if args.columns {
        println!("Columns ({}):", headers.len());
        for h in &headers {
            println!("  {}", h);
        }
        return Ok(());
    }

    println!(
        "{}",
        format!(
            "fintrack session {} | {}x{} @ {:.0} fps",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            config.source.width,
            config.source.height,
            config.source.fps
        )
        .green()
    );
    println!(
        "Schema: {} columns, monitored {:?}, display modes {:?}",
        headers.len(),
        chain.monitored_headers(),
        chain.diagnostic_names()
    );

    // 2. Wire up the pipeline
    let accumulator = Arc::new(DataAccumulator::new(headers.clone()));
    let (frame_tx, frame_rx) = frame_channel(16);
    let (display_tx, display_rx) = display_channel(config.display_depth);
    let dispatcher = FrameDispatcher::start(
        frame_rx,
        chain,
        accumulator.clone(),
        display_tx,
        DispatcherOptions::default(),
    );
    if config.display_mode.is_some() {
        dispatcher
            .control()
            .send(ControlUpdate::DisplayMode(config.display_mode.clone()))?;
    }
    let status = dispatcher.status().clone();

    // 3. Start the (synthetic) camera
    let source = SyntheticSource::start(config.source, frame_tx);
    println!("Pipeline running for {:.1}s...", args.duration);

    // 4. Demo loop: play the role of the display + live-feedback consumers
    let monitored: Vec<usize> = config
        .monitored_headers
        .iter()
        .filter_map(|name| headers.iter().position(|h| h == name))
        .collect();
    let started = Instant::now();
    let duration = Duration::from_secs_f64(args.duration.max(0.1));
    let mut frames_shown = 0u64;
    let mut newest_shown = f64::NEG_INFINITY;
    let mut last_report = Instant::now();
    let mut threshold_bumped = false;

    while started.elapsed() < duration {
        // Display path: drain whatever the drop-oldest channel holds.
        while let Ok(frame) = display_rx.try_recv() {
            frames_shown += 1;
            newest_shown = frame.t;
        }

        // Live feedback: monitored columns of the newest row.
        if last_report.elapsed() >= Duration::from_millis(500) {
            if let Some(row) = accumulator.latest(1).pop() {
                let readout: Vec<String> = monitored
                    .iter()
                    .map(|&i| format!("{}={:+.3}", headers[i], row.values[i]))
                    .collect();
                println!("t={:7.3}  {}", row.t, readout.join("  "));
            }
            last_report = Instant::now();
        }

        // Halfway through, push a parameter change like a GUI would.
        if !threshold_bumped && started.elapsed() >= duration / 2 {
            let new_threshold = config.eyes.threshold.saturating_sub(10);
            dispatcher
                .control()
                .send(ControlUpdate::EyeThreshold(new_threshold))?;
            println!("{}", format!("eye threshold -> {}", new_threshold).yellow());
            threshold_bumped = true;
        }

        for event in status.try_iter() {
            report(&event);
        }
        thread::sleep(Duration::from_millis(20));
    }

    // 5. Cooperative shutdown: source first, then the dispatcher.
    source.stop();
    dispatcher.stop();
    for event in status.try_iter() {
        report(&event);
    }

    // 6. Summary
    let (headers, rows) = accumulator.snapshot();
    println!(
        "{}",
        format!(
            "Accumulated {} rows ({} columns), {} out-of-order rejects, {} frames displayed (newest t={:.3})",
            rows.len(),
            headers.len(),
            accumulator.rejected(),
            frames_shown,
            newest_shown
        )
        .green()
    );
    for row in rows.iter().rev().take(args.tail_rows).rev() {
        let first: Vec<String> = row.values.iter().take(4).map(|v| format!("{:+.3}", v)).collect();
        println!("  t={:7.3}  [{} ...]", row.t, first.join(", "));
    }

    Ok(())
}

fn report(event: &StatusEvent) {
    match event {
        StatusEvent::Started => println!("{}", "dispatcher started".green()),
        StatusEvent::FrameFailure { t, message } => {
            println!("{}", format!("t={:.3} {}", t, message.trim_end()).yellow())
        }
        StatusEvent::OutOfOrder { t } => {
            println!("{}", format!("rejected out-of-order frame t={:.3}", t).yellow())
        }
        StatusEvent::SchemaReset { columns } => {
            println!("{}", format!("schema reset: {} columns", columns.len()).yellow())
        }
        StatusEvent::SourceStalled { silent_for } => println!(
            "{}",
            format!("camera silent for {:.1}s, still polling", silent_for).red()
        ),
        StatusEvent::SourceRecovered => println!("{}", "camera recovered".green()),
        StatusEvent::Fatal { error } => println!("{}", format!("fatal: {}", error).red()),
        StatusEvent::Stopped { frames_processed } => println!(
            "{}",
            format!("dispatcher stopped after {} frames", frames_processed).green()
        ),
    }
}
