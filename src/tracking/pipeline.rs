//! Frame loop: tracker backend -> confirmation engine -> shared snapshot.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::detect::{Frame, TrackerBackend};

use super::engine::{ConfirmationEngine, ConfirmedDetection};

/// Latest confirmed set, shared between the frame loop and the collector.
#[derive(Clone, Debug, Default)]
pub struct SnapshotCell {
    inner: Arc<Mutex<Vec<ConfirmedDetection>>>,
}

impl SnapshotCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, detections: Vec<ConfirmedDetection>) -> Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| anyhow!("snapshot lock poisoned"))?;
        *guard = detections;
        Ok(())
    }

    pub fn latest(&self) -> Result<Vec<ConfirmedDetection>> {
        let guard = self
            .inner
            .lock()
            .map_err(|_| anyhow!("snapshot lock poisoned"))?;
        Ok(guard.clone())
    }
}

/// Paces synthetic frames at a target rate.
pub struct FrameClock {
    interval: Duration,
    width: u32,
    height: u32,
    next_sequence: u64,
    last_tick: Option<Instant>,
}

impl FrameClock {
    pub fn new(target_fps: u32, width: u32, height: u32) -> Self {
        let interval = Duration::from_secs(1) / target_fps.max(1);
        Self {
            interval,
            width,
            height,
            next_sequence: 0,
            last_tick: None,
        }
    }

    /// Block until the next frame is due, then return it.
    pub fn tick(&mut self) -> Frame {
        if let Some(last) = self.last_tick {
            let elapsed = last.elapsed();
            if elapsed < self.interval {
                std::thread::sleep(self.interval - elapsed);
            }
        }
        self.last_tick = Some(Instant::now());
        let frame = Frame::new(self.next_sequence, self.width, self.height);
        self.next_sequence += 1;
        frame
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames: u64,
    pub failed_frames: u64,
    pub confirmed_last_frame: usize,
}

pub struct TrackingPipeline {
    backend: Box<dyn TrackerBackend>,
    engine: ConfirmationEngine,
    snapshot: SnapshotCell,
    stats: PipelineStats,
}

impl TrackingPipeline {
    pub fn new(
        backend: Box<dyn TrackerBackend>,
        engine: ConfirmationEngine,
        snapshot: SnapshotCell,
    ) -> Self {
        Self {
            backend,
            engine,
            snapshot,
            stats: PipelineStats::default(),
        }
    }

    pub fn snapshot(&self) -> SnapshotCell {
        self.snapshot.clone()
    }

    pub fn engine(&self) -> &ConfirmationEngine {
        &self.engine
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Process one frame. A tracker failure skips the frame and leaves both the
    /// engine state and the published snapshot as they were.
    pub fn process_frame(&mut self, frame: &Frame) -> Result<usize> {
        self.stats.frames += 1;
        let output = match self.backend.update(frame) {
            Ok(output) => output,
            Err(err) => {
                self.stats.failed_frames += 1;
                self.engine.skip_frame();
                log::warn!(
                    "tracker {} failed on frame {}: {}",
                    self.backend.name(),
                    frame.sequence,
                    err
                );
                return Ok(0);
            }
        };
        let confirmed = self.engine.update(&output.into_raw_tracks());
        let count = confirmed.len();
        self.stats.confirmed_last_frame = count;
        self.snapshot.publish(confirmed)?;
        Ok(count)
    }

    /// Run until `shutdown` is raised or the backend is exhausted.
    pub fn run(&mut self, clock: &mut FrameClock, shutdown: &AtomicBool) -> Result<()> {
        log::info!("tracking pipeline started (backend={})", self.backend.name());
        let mut last_health_log = Instant::now();
        while !shutdown.load(Ordering::SeqCst) {
            if self.backend.is_exhausted() {
                log::info!("tracker {} exhausted, stopping", self.backend.name());
                break;
            }
            let frame = clock.tick();
            self.process_frame(&frame)?;

            if last_health_log.elapsed() >= Duration::from_secs(5) {
                log::info!(
                    "tracking frames={} failed={} tracked_ids={} confirmed={}",
                    self.stats.frames,
                    self.stats.failed_frames,
                    self.engine.tracked(),
                    self.stats.confirmed_last_frame
                );
                last_health_log = Instant::now();
            }
        }
        Ok(())
    }
}
