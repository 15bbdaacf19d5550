//! Track confirmation.
//!
//! Turns the noisy per-frame track list into a small set of confirmed
//! detections. An id is reported only once it has been visible for
//! `stable_frames_threshold` consecutive frames; one missed frame resets it.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::detect::{RawTrack, TrackId};

pub const DEFAULT_STABLE_FRAMES_THRESHOLD: u32 = 48;
pub const DEFAULT_BOOTSTRAP_WINDOW: u32 = 5;
pub const UNKNOWN_CLASS: &str = "unknown";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConfirmationConfig {
    /// Minimum consecutive-frame age before a track is reported.
    pub stable_frames_threshold: u32,
    /// While an id's age is below this, a freshly matched class replaces the
    /// remembered one. Afterwards the class is sticky.
    pub bootstrap_window: u32,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            stable_frames_threshold: DEFAULT_STABLE_FRAMES_THRESHOLD,
            bootstrap_window: DEFAULT_BOOTSTRAP_WINDOW,
        }
    }
}

/// A track that has survived long enough to be reported.
///
/// Serialises to the wire shape `{"id", "bbox": [x1,y1,x2,y2], "age", "class"}`
/// with plain integers and strings only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmedDetection {
    pub id: TrackId,
    pub bbox: [i64; 4],
    pub age: u32,
    pub class: String,
}

#[derive(Debug)]
pub struct ConfirmationEngine {
    config: ConfirmationConfig,
    /// id -> consecutive-frame age. Only ids visible in the last frame.
    history: HashMap<TrackId, u32>,
    /// id -> remembered class. Keys are always a subset of `history`.
    classes: HashMap<TrackId, String>,
    frames_processed: u64,
    frames_skipped: u64,
}

impl ConfirmationEngine {
    pub fn new(config: ConfirmationConfig) -> Self {
        Self {
            config,
            history: HashMap::new(),
            classes: HashMap::new(),
            frames_processed: 0,
            frames_skipped: 0,
        }
    }

    pub fn config(&self) -> ConfirmationConfig {
        self.config
    }

    /// Feed one frame of raw tracks and return the confirmed set for it.
    ///
    /// Tracks without a bounding box are dropped for this frame and count as
    /// absent. A repeated id within one frame is only counted once.
    pub fn update(&mut self, tracks: &[RawTrack]) -> Vec<ConfirmedDetection> {
        self.frames_processed += 1;

        let mut visible: HashSet<TrackId> = HashSet::with_capacity(tracks.len());
        let mut current: Vec<(&RawTrack, [i64; 4])> = Vec::with_capacity(tracks.len());

        for track in tracks {
            let Some(bbox) = track.bbox else {
                log::debug!("dropping track {} without bbox", track.id);
                continue;
            };
            if !visible.insert(track.id.clone()) {
                log::debug!("ignoring repeated track {} in frame", track.id);
                continue;
            }

            let age = {
                let age = self.history.entry(track.id.clone()).or_insert(0);
                *age += 1;
                *age
            };

            if let Some(class) = &track.class {
                let remembered = self.classes.contains_key(&track.id);
                if !remembered || age < self.config.bootstrap_window {
                    self.classes.insert(track.id.clone(), class.clone());
                }
            }

            current.push((track, bbox.to_pixels()));
        }

        self.history.retain(|id, _| visible.contains(id));
        self.classes.retain(|id, _| visible.contains(id));

        current
            .into_iter()
            .filter_map(|(track, bbox)| {
                let age = self.history.get(&track.id).copied().unwrap_or(0);
                if age < self.config.stable_frames_threshold {
                    return None;
                }
                Some(ConfirmedDetection {
                    id: track.id.clone(),
                    bbox,
                    age,
                    class: self
                        .classes
                        .get(&track.id)
                        .cloned()
                        .unwrap_or_else(|| UNKNOWN_CLASS.to_string()),
                })
            })
            .collect()
    }

    /// Record a frame the tracker failed on. History and classes are untouched.
    pub fn skip_frame(&mut self) {
        self.frames_skipped += 1;
    }

    pub fn age_of(&self, id: &TrackId) -> Option<u32> {
        self.history.get(id).copied()
    }

    pub fn class_of(&self, id: &TrackId) -> Option<&str> {
        self.classes.get(id).map(String::as_str)
    }

    /// Number of ids currently being aged.
    pub fn tracked(&self) -> usize {
        self.history.len()
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    pub fn frames_skipped(&self) -> u64 {
        self.frames_skipped
    }
}

impl Default for ConfirmationEngine {
    fn default() -> Self {
        Self::new(ConfirmationConfig::default())
    }
}
