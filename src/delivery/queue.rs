//! Delivery queue: ordered, per-id deduplicated buffer of confirmed detections.
//!
//! Holds at most one pending entry per id. An offer for an id that is already
//! queued is a no-op, so the queue carries the oldest pending snapshot for that
//! id. Once the entry is drained the id may be queued again.
//!
//! The queue is bounded. When full, the oldest entry is evicted and counted in
//! `dropped()`; eviction is logged, never silent.

use anyhow::{anyhow, Result};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::detect::TrackId;
use crate::tracking::ConfirmedDetection;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Result of `DeliveryQueue::offer`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OfferOutcome {
    Enqueued,
    /// An entry with the same id is already pending.
    AlreadyQueued,
    /// Enqueued after evicting the oldest entry to stay within capacity.
    EnqueuedWithEviction(TrackId),
}

#[derive(Debug)]
pub struct DeliveryQueue {
    entries: VecDeque<ConfirmedDetection>,
    pending: HashSet<TrackId>,
    capacity: usize,
    dropped: u64,
}

impl DeliveryQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(DEFAULT_QUEUE_CAPACITY)),
            pending: HashSet::new(),
            capacity,
            dropped: 0,
        }
    }

    /// Append to the tail unless the id is already pending.
    pub fn offer(&mut self, detection: ConfirmedDetection) -> OfferOutcome {
        if self.pending.contains(&detection.id) {
            return OfferOutcome::AlreadyQueued;
        }
        let evicted = if self.entries.len() >= self.capacity {
            self.evict_oldest()
        } else {
            None
        };
        self.pending.insert(detection.id.clone());
        self.entries.push_back(detection);
        match evicted {
            Some(id) => OfferOutcome::EnqueuedWithEviction(id),
            None => OfferOutcome::Enqueued,
        }
    }

    /// Remove and return the head entry.
    pub fn drain(&mut self) -> Option<ConfirmedDetection> {
        let detection = self.entries.pop_front()?;
        self.pending.remove(&detection.id);
        Some(detection)
    }

    /// Put an entry that failed to send back at the head.
    ///
    /// Returns false (and drops the entry) if a newer entry for the same id was
    /// queued in the meantime.
    pub fn restore(&mut self, detection: ConfirmedDetection) -> bool {
        if self.pending.contains(&detection.id) {
            return false;
        }
        if self.entries.len() >= self.capacity {
            // the restored entry is the oldest; the tail is what gets dropped
            if let Some(tail) = self.entries.pop_back() {
                self.pending.remove(&tail.id);
                self.dropped += 1;
                log::warn!(
                    "delivery queue full, dropped newest entry {} (total dropped {})",
                    tail.id,
                    self.dropped
                );
            }
        }
        self.pending.insert(detection.id.clone());
        self.entries.push_front(detection);
        true
    }

    pub fn contains(&self, id: &TrackId) -> bool {
        self.pending.contains(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries evicted because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn evict_oldest(&mut self) -> Option<TrackId> {
        let oldest = self.entries.pop_front()?;
        self.pending.remove(&oldest.id);
        self.dropped += 1;
        log::warn!(
            "delivery queue full ({}), evicted oldest entry {} (total dropped {})",
            self.capacity,
            oldest.id,
            self.dropped
        );
        Some(oldest.id)
    }
}

impl Default for DeliveryQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

/// Queue shared between the collector and the sender threads.
#[derive(Clone, Debug, Default)]
pub struct SharedQueue {
    inner: Arc<Mutex<DeliveryQueue>>,
}

impl SharedQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(DeliveryQueue::new(capacity))),
        }
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, DeliveryQueue>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("delivery queue lock poisoned"))
    }

    pub fn offer(&self, detection: ConfirmedDetection) -> Result<OfferOutcome> {
        Ok(self.lock()?.offer(detection))
    }

    pub fn drain(&self) -> Result<Option<ConfirmedDetection>> {
        Ok(self.lock()?.drain())
    }

    pub fn restore(&self, detection: ConfirmedDetection) -> Result<bool> {
        Ok(self.lock()?.restore(detection))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(id: i64, x: i64) -> ConfirmedDetection {
        ConfirmedDetection {
            id: TrackId::Int(id),
            bbox: [x, 0, x + 10, 10],
            age: 48,
            class: "car".to_string(),
        }
    }

    #[test]
    fn duplicate_offer_keeps_oldest_snapshot() {
        let mut queue = DeliveryQueue::default();
        assert_eq!(queue.offer(det(3, 0)), OfferOutcome::Enqueued);
        assert_eq!(queue.offer(det(3, 50)), OfferOutcome::AlreadyQueued);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.drain().expect("entry").bbox, [0, 0, 10, 10]);
        assert!(queue.drain().is_none());
    }

    #[test]
    fn offer_after_drain_succeeds() {
        let mut queue = DeliveryQueue::default();
        queue.offer(det(3, 0));
        queue.drain();
        assert_eq!(queue.offer(det(3, 5)), OfferOutcome::Enqueued);
        assert!(queue.contains(&TrackId::Int(3)));
    }

    #[test]
    fn drains_in_offer_order() {
        let mut queue = DeliveryQueue::default();
        for id in [5, 1, 9, 2] {
            queue.offer(det(id, 0));
        }
        queue.offer(det(1, 99));
        let order: Vec<TrackId> = std::iter::from_fn(|| queue.drain()).map(|d| d.id).collect();
        assert_eq!(
            order,
            vec![TrackId::Int(5), TrackId::Int(1), TrackId::Int(9), TrackId::Int(2)]
        );
    }

    #[test]
    fn full_queue_evicts_oldest_and_counts_loss() {
        let mut queue = DeliveryQueue::new(2);
        queue.offer(det(1, 0));
        queue.offer(det(2, 0));
        assert_eq!(
            queue.offer(det(3, 0)),
            OfferOutcome::EnqueuedWithEviction(TrackId::Int(1))
        );
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
        assert!(!queue.contains(&TrackId::Int(1)));
        assert_eq!(queue.drain().expect("head").id, TrackId::Int(2));
    }

    #[test]
    fn restore_puts_entry_back_at_head() {
        let mut queue = DeliveryQueue::default();
        queue.offer(det(1, 0));
        queue.offer(det(2, 0));
        let head = queue.drain().expect("head");
        assert!(queue.restore(head));
        assert_eq!(queue.drain().expect("head").id, TrackId::Int(1));
    }

    #[test]
    fn restore_yields_to_newer_entry_for_same_id() {
        let mut queue = DeliveryQueue::default();
        queue.offer(det(1, 0));
        let head = queue.drain().expect("head");
        queue.offer(det(1, 40));
        assert!(!queue.restore(head));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.drain().expect("entry").bbox[0], 40);
    }

    #[test]
    fn restore_into_full_queue_drops_tail() {
        let mut queue = DeliveryQueue::new(2);
        queue.offer(det(1, 0));
        queue.offer(det(2, 0));
        let head = queue.drain().expect("head");
        queue.offer(det(3, 0));
        assert!(queue.restore(head));
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.drain().expect("head").id, TrackId::Int(1));
        assert_eq!(queue.drain().expect("next").id, TrackId::Int(2));
        assert!(queue.is_empty());
    }

    #[test]
    fn shared_queue_is_usable_across_threads() {
        let queue = SharedQueue::new(16);
        let producer = queue.clone();
        let handle = std::thread::spawn(move || {
            for id in 0..8 {
                producer.offer(det(id, 0)).expect("offer");
            }
        });
        handle.join().expect("producer thread");
        assert_eq!(queue.len().expect("len"), 8);
        assert_eq!(queue.drain().expect("drain").expect("entry").id, TrackId::Int(0));
    }
}
