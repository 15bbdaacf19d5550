mod backend;
pub mod backends;
mod normalize;
mod registry;
mod result;

pub use backend::{Frame, TrackerBackend};
pub use backends::{ReplayTracker, ScriptedTracker};
pub use normalize::{nearest_detection, TrackerOutput};
pub use registry::{BackendRegistry, SharedTracker};
pub use result::{BoundingBox, DetectionBox, RawTrack, TrackId};
