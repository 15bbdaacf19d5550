//! edge_client - Stream confirmed detections from an edge device to a collector.
//!
//! This daemon:
//! 1. Runs the tracker backend (replayed recording or built-in demo script)
//! 2. Confirms stable tracks and queues newly confirmed ids
//! 3. Registers with the collector and drains the queue while connected
//! 4. Reconnects with backoff when the link drops
//! 5. Sends an explicit disconnect on Ctrl-C

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use telemetry_relay::config::ClientConfig;
use telemetry_relay::delivery::{Collector, SharedQueue};
use telemetry_relay::detect::{
    BackendRegistry, BoundingBox, RawTrack, ReplayTracker, ScriptedTracker, TrackerBackend,
    TrackerOutput,
};
use telemetry_relay::tracking::{ConfirmationEngine, FrameClock, SnapshotCell, TrackingPipeline};
use telemetry_relay::transport::TcpConnector;
use telemetry_relay::ConnectionManager;

const DEMO_FRAMES: u64 = 3000;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Stream confirmed detections to a telemetry collector"
)]
struct Args {
    /// Config file (.json, otherwise TOML).
    #[arg(long, env = "TELEMETRY_CONFIG")]
    config: Option<PathBuf>,

    /// Replay recorded tracker output (one JSON frame per line).
    /// Without it the built-in demo script is used.
    #[arg(long, env = "TELEMETRY_REPLAY")]
    replay: Option<PathBuf>,

    /// Target frame rate of the tracking loop.
    #[arg(long, env = "TELEMETRY_FPS", default_value_t = 25)]
    fps: u32,

    #[arg(long, default_value_t = 640)]
    width: u32,

    #[arg(long, default_value_t = 480)]
    height: u32,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = ClientConfig::load_from(args.config.as_deref())?;

    let mut backends = BackendRegistry::new();
    backends.register(demo_script(DEMO_FRAMES));
    if let Some(path) = &args.replay {
        backends.register(ReplayTracker::open(path)?);
        backends.set_default("replay")?;
    }
    let tracker = backends.select(None)?;
    log::info!(
        "tracker backend '{}' selected from {:?}",
        tracker.name(),
        backends.list()
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst))
            .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;
    }

    let snapshot = SnapshotCell::new();
    let queue = SharedQueue::new(config.queue_capacity);

    let mut pipeline = TrackingPipeline::new(
        Box::new(tracker),
        ConfirmationEngine::new(config.confirmation),
        snapshot.clone(),
    );
    let pipeline_thread = {
        let shutdown = shutdown.clone();
        let mut clock = FrameClock::new(args.fps, args.width, args.height);
        thread::spawn(move || {
            if let Err(err) = pipeline.run(&mut clock, &shutdown) {
                log::error!("tracking pipeline stopped: {:#}", err);
            }
        })
    };

    let collector_thread = {
        let shutdown = shutdown.clone();
        let queue = queue.clone();
        let interval = config.detect_interval;
        thread::spawn(move || {
            let mut collector = Collector::new(queue);
            if let Err(err) = collector.run(&snapshot, interval, &shutdown) {
                log::error!("collector stopped: {:#}", err);
            }
        })
    };

    log::info!(
        "edge_client {} streaming to {}",
        config.client_id,
        config.server
    );
    let connector = TcpConnector::new(&config.server).with_connect_timeout(config.handshake_timeout);
    let mut manager = ConnectionManager::new(connector, config.manager_settings(), queue.clone());
    let result = manager.run(&shutdown);

    shutdown.store(true, Ordering::SeqCst);
    pipeline_thread
        .join()
        .map_err(|_| anyhow!("tracking thread panicked"))?;
    collector_thread
        .join()
        .map_err(|_| anyhow!("collector thread panicked"))?;

    {
        let pending = queue.lock()?;
        log::info!(
            "edge_client stopped: sent={} pending={} dropped={}",
            manager.sent(),
            pending.len(),
            pending.dropped()
        );
    }
    result
}

/// Three objects crossing the frame; the bicycle leaves and re-enters.
fn demo_script(frames: u64) -> ScriptedTracker {
    let mut script = ScriptedTracker::new();
    for n in 0..frames {
        let x = (n % 400) as f32;
        let mut tracks = vec![
            RawTrack::new(1, BoundingBox::new(x, 40.0, x + 60.0, 120.0)).with_class("car"),
            RawTrack::new(2, BoundingBox::new(300.0, x / 2.0, 340.0, x / 2.0 + 90.0))
                .with_class("person"),
        ];
        if n % 120 < 90 {
            tracks.push(
                RawTrack::new(3, BoundingBox::new(500.0 - x / 2.0, 200.0, 560.0 - x / 2.0, 260.0))
                    .with_class("bicycle"),
            );
        }
        script.push(TrackerOutput::labelled(tracks));
    }
    script
}
