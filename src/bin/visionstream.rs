//! visionstream - play a source through the engine and report what happens
//!
//! This binary:
//! 1. Loads `EngineConfig` (defaults, optional file, env overrides)
//! 2. Starts the engine on the given source
//! 3. Polls the latest frame at display rate and prints lifecycle events
//! 4. Stops on Ctrl-C, after `--seconds`, or once retries are exhausted

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossbeam_channel::{after, bounded, never, select, tick, Receiver};
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};

use visionstream::{
    EngineConfig, EngineEvent, LatencyTracker, StreamEngine, StreamSource,
};

/// Consumer poll cadence, roughly one display refresh.
const POLL_INTERVAL: Duration = Duration::from_millis(33);
const REPORT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// RTSP URL, file path, device id, or stub://name for a synthetic stream.
    source: String,
    /// Source kind; inferred from the address when omitted.
    #[arg(long, value_parser = ["rtsp", "file", "device"])]
    kind: Option<String>,
    /// Stop after this many seconds (runs until Ctrl-C otherwise).
    #[arg(long)]
    seconds: Option<u64>,
    /// Engine config file (JSON, or TOML by extension).
    #[arg(long, env = "VISIONSTREAM_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => EngineConfig::load_from(path)?,
        None => EngineConfig::load()?,
    };
    let source = match args.kind.as_deref() {
        Some("rtsp") => StreamSource::rtsp(args.source.as_str()),
        Some("file") => StreamSource::file(args.source.as_str()),
        Some("device") => StreamSource::device(args.source.as_str()),
        Some(other) => return Err(anyhow!("unknown source kind: {other}")),
        None => StreamSource::from_address(args.source.as_str()),
    };
    source
        .validate()
        .map_err(|e| anyhow!("{} ({e})", e.user_message()))?;

    let engine = StreamEngine::new(config).context("failed to start engine threads")?;
    let events = engine.events();

    let (stop_tx, stop_rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("error setting Ctrl-C handler")?;

    log::info!("visionstream: starting {source}");
    engine.start(source);

    let deadline: Receiver<Instant> = match args.seconds {
        Some(secs) => after(Duration::from_secs(secs)),
        None => never(),
    };
    let poll = tick(POLL_INTERVAL);
    let report = tick(REPORT_INTERVAL);
    let mut latency = LatencyTracker::default();
    let mut last_sequence = 0u64;

    loop {
        select! {
            recv(stop_rx) -> _ => {
                log::info!("shutdown signal received, stopping engine...");
                break;
            }
            recv(deadline) -> _ => {
                log::info!("run time elapsed, stopping engine...");
                break;
            }
            recv(events) -> event => {
                let Ok(event) = event else { break };
                print_event(&event);
                if event.is_terminal_error() {
                    log::error!("giving up; restart manually to try again");
                    break;
                }
            }
            recv(poll) -> _ => {
                if let Some(frame) = engine.current_frame() {
                    if frame.sequence() != last_sequence {
                        last_sequence = frame.sequence();
                        latency.record(frame.age_at(SystemTime::now()));
                    }
                }
            }
            recv(report) -> _ => {
                let stats = engine.stats();
                log::info!(
                    "state={} frames={} fps={:.1} latency avg={:?} max={:?}",
                    stats.state,
                    stats.frames_decoded,
                    stats.current_fps,
                    latency.average(),
                    latency.max()
                );
            }
        }
    }

    engine.stop();
    while let Ok(event) = events.try_recv() {
        print_event(&event);
    }
    Ok(())
}

fn print_event(event: &EngineEvent) {
    match event {
        EngineEvent::Connected(meta) => println!(
            "connected: {} {} @ {:.2} fps",
            meta.codec,
            meta.resolution(),
            meta.frame_rate
        ),
        EngineEvent::Reconnecting { attempt, delay } => {
            println!("reconnecting: attempt {attempt} in {:.1}s", delay.as_secs_f64())
        }
        EngineEvent::Disconnected(err) => println!("disconnected: {}", err.user_message()),
        EngineEvent::Error(err) => println!("error: {} ({err})", err.user_message()),
        EngineEvent::Stopped => println!("stopped"),
    }
}
