//! Edge-side connection management.

mod manager;
mod reconnect;

pub use manager::{ConnectionManager, ConnectionState, InboundOutcome, ManagerSettings, PumpOutcome};
pub use reconnect::ReconnectPolicy;
