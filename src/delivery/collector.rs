use anyhow::Result;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::detect::TrackId;
use crate::tracking::{ConfirmedDetection, SnapshotCell};

use super::queue::{OfferOutcome, SharedQueue};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CollectStats {
    pub offered: usize,
    pub enqueued: usize,
    pub already_queued: usize,
    pub evicted: usize,
}

/// Copies newly confirmed ids from the tracking snapshot into the delivery queue.
///
/// An id counts as new when it was absent from the previous poll's snapshot,
/// so a track that stays confirmed is offered once, and one that drops out and
/// re-confirms is offered again. New ids are offered in the order they crossed
/// the stability threshold, oldest first.
pub struct Collector {
    queue: SharedQueue,
    previous: HashSet<TrackId>,
}

impl Collector {
    pub fn new(queue: SharedQueue) -> Self {
        Self {
            queue,
            previous: HashSet::new(),
        }
    }

    pub fn collect(&mut self, snapshot: &[ConfirmedDetection]) -> Result<CollectStats> {
        let mut stats = CollectStats::default();
        let current: HashSet<TrackId> = snapshot.iter().map(|d| d.id.clone()).collect();
        let mut fresh: Vec<&ConfirmedDetection> = snapshot
            .iter()
            .filter(|d| !self.previous.contains(&d.id))
            .collect();
        // Older tracks crossed the threshold earlier; ties keep snapshot order.
        fresh.sort_by(|a, b| b.age.cmp(&a.age));
        for detection in fresh {
            stats.offered += 1;
            match self.queue.offer(detection.clone())? {
                OfferOutcome::Enqueued => stats.enqueued += 1,
                OfferOutcome::AlreadyQueued => stats.already_queued += 1,
                OfferOutcome::EnqueuedWithEviction(_) => {
                    stats.enqueued += 1;
                    stats.evicted += 1;
                }
            }
        }
        self.previous = current;
        if stats.enqueued > 0 {
            log::debug!(
                "collector queued {} new detections ({} already pending)",
                stats.enqueued,
                stats.already_queued
            );
        }
        Ok(stats)
    }

    /// Poll `snapshot` every `interval` until `shutdown` is raised.
    pub fn run(
        &mut self,
        snapshot: &SnapshotCell,
        interval: Duration,
        shutdown: &AtomicBool,
    ) -> Result<()> {
        log::info!("collector polling every {}ms", interval.as_millis());
        while !shutdown.load(Ordering::SeqCst) {
            let latest = snapshot.latest()?;
            self.collect(&latest)?;
            std::thread::sleep(interval);
        }
        Ok(())
    }
}
