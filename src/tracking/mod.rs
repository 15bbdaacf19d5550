mod engine;
mod pipeline;

pub use engine::{
    ConfirmationConfig, ConfirmationEngine, ConfirmedDetection, DEFAULT_BOOTSTRAP_WINDOW,
    DEFAULT_STABLE_FRAMES_THRESHOLD, UNKNOWN_CLASS,
};
pub use pipeline::{FrameClock, PipelineStats, SnapshotCell, TrackingPipeline};
