//! Buffering between detection cadence and network availability.

mod collector;
mod queue;

pub use collector::{CollectStats, Collector};
pub use queue::{DeliveryQueue, OfferOutcome, SharedQueue, DEFAULT_QUEUE_CAPACITY};
