use anyhow::Result;

use super::normalize::TrackerOutput;

/// A processed video frame as seen by the tracker boundary.
///
/// Capture and decoding happen outside this crate; only the sequence number and
/// geometry travel with the frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Frame {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub fn new(sequence: u64, width: u32, height: u32) -> Self {
        Self {
            sequence,
            width,
            height,
        }
    }
}

/// Object detector + multi-object tracker, consumed per frame.
///
/// An `Err` means the frame could not be detected/tracked; callers skip it.
pub trait TrackerBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection and tracking on a frame.
    ///
    /// Whether classes are attached is carried by the `TrackerOutput` variant.
    fn update(&mut self, frame: &Frame) -> Result<TrackerOutput>;

    /// True once the backend has nothing more to produce (end of a recording).
    fn is_exhausted(&self) -> bool {
        false
    }
}
