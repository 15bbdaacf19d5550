pub mod replay;
pub mod stub;

pub use replay::ReplayTracker;
pub use stub::ScriptedTracker;
