use anyhow::{anyhow, Result};
use std::collections::VecDeque;

use crate::detect::backend::{Frame, TrackerBackend};
use crate::detect::normalize::TrackerOutput;

/// Scripted backend for tests and demos.
///
/// Each call to `update` pops the next scripted frame. `None` entries simulate
/// a frame the detector failed on. Once the script runs out every frame is
/// empty.
pub struct ScriptedTracker {
    frames: VecDeque<Option<TrackerOutput>>,
}

impl ScriptedTracker {
    pub fn new() -> Self {
        Self {
            frames: VecDeque::new(),
        }
    }

    pub fn from_frames(frames: Vec<TrackerOutput>) -> Self {
        Self {
            frames: frames.into_iter().map(Some).collect(),
        }
    }

    /// Append a frame to the script.
    pub fn push(&mut self, output: TrackerOutput) {
        self.frames.push_back(Some(output));
    }

    /// Append a frame the backend will fail on.
    pub fn push_failure(&mut self) {
        self.frames.push_back(None);
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl Default for ScriptedTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackerBackend for ScriptedTracker {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn update(&mut self, frame: &Frame) -> Result<TrackerOutput> {
        match self.frames.pop_front() {
            Some(Some(output)) => Ok(output),
            Some(None) => Err(anyhow!(
                "scripted tracker failure at frame {}",
                frame.sequence
            )),
            None => Ok(TrackerOutput::labelled(vec![])),
        }
    }

    fn is_exhausted(&self) -> bool {
        self.frames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::result::{BoundingBox, RawTrack};

    #[test]
    fn replays_script_then_goes_quiet() {
        let track = RawTrack::new(3, BoundingBox::new(0.0, 0.0, 1.0, 1.0));
        let mut tracker = ScriptedTracker::new();
        tracker.push(TrackerOutput::labelled(vec![track.clone()]));
        tracker.push_failure();

        let frame = Frame::new(1, 640, 480);
        assert_eq!(
            tracker.update(&frame).expect("first frame"),
            TrackerOutput::labelled(vec![track])
        );
        assert!(tracker.update(&frame).is_err());
        assert!(tracker.is_exhausted());
        assert!(tracker.update(&frame).expect("empty frame").is_empty());
    }
}
