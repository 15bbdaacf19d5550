//! Collector-side session handling.
//!
//! A `SessionServer` accepts edge connections and routes their control
//! actions through one `SessionRegistry`; everything else a bound client sends
//! is handed to a `TelemetrySink`.

mod registry;
mod session;
mod sink;

pub use registry::{Binding, ClientSession, ConnectionId, Registration, SessionRegistry};
pub use session::{ServerHandle, SessionServer};
pub use sink::{ChannelSink, LogSink, TelemetryEvent, TelemetrySink};
